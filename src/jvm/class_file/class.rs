use crate::jvm::class_file::{
    Attribute, ClassConstantIndex, ConstantIndex, ConstantPool, Field, Method, Parse, Serialize,
    Version,
};
use crate::jvm::{ClassAccessFlags, Error};
use byteorder::WriteBytesExt;
use std::fs;
use std::io::Read;
use std::path::Path;

/// Representation of the [`class` file format of the JVM][0]
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html
pub struct ClassFile {
    pub version: Version,
    pub constants: ConstantPool,
    pub access_flags: ClassAccessFlags,
    pub this_class: ClassConstantIndex,
    pub super_class: ClassConstantIndex,
    pub interfaces: Vec<ClassConstantIndex>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Magic header bytes that go at the front of the serialized class file
    const MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

    /// Parse a class file from its bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<ClassFile, Error> {
        let mut reader = bytes;
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != ClassFile::MAGIC {
            return Err(Error::BadMagic(magic));
        }
        Ok(ClassFile {
            version: Version::parse(&mut reader)?,
            constants: ConstantPool::parse(&mut reader)?,
            access_flags: ClassAccessFlags::parse(&mut reader)?,
            this_class: ClassConstantIndex::parse(&mut reader)?,
            super_class: ClassConstantIndex::parse(&mut reader)?,
            interfaces: Vec::parse(&mut reader)?,
            fields: Vec::parse(&mut reader)?,
            methods: Vec::parse(&mut reader)?,
            attributes: Vec::parse(&mut reader)?,
        })
    }

    /// Encode the class file into bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = vec![];
        self.serialize(&mut bytes)?;
        Ok(bytes)
    }

    /// Save the class file to disk
    pub fn save_to_path<P: AsRef<Path>>(
        &self,
        path: P,
        create_missing_directories: bool,
    ) -> std::io::Result<()> {
        let path = path.as_ref();
        if create_missing_directories {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut class_file = fs::File::create(path)?;
        self.serialize(&mut class_file)
    }

    /// Internal name of the class (eg. `java/lang/String`)
    pub fn this_class_name(&self) -> Result<&str, Error> {
        self.constants.class_name(self.this_class)
    }

    /// Internal name of the super class (only `java/lang/Object` has none)
    pub fn super_class_name(&self) -> Result<Option<&str>, Error> {
        if self.super_class.0 == ConstantIndex(0) {
            Ok(None)
        } else {
            self.constants.class_name(self.super_class).map(Some)
        }
    }

    /// Internal names of the directly implemented interfaces
    pub fn interface_names(&self) -> Result<Vec<&str>, Error> {
        self.interfaces
            .iter()
            .map(|iface| self.constants.class_name(*iface))
            .collect()
    }
}

impl Serialize for ClassFile {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&ClassFile::MAGIC)?;
        self.version.serialize(writer)?;
        self.constants.serialize(writer)?;
        self.access_flags.serialize(writer)?;
        self.this_class.serialize(writer)?;
        self.super_class.serialize(writer)?;
        self.interfaces.serialize(writer)?;
        self.fields.serialize(writer)?;
        self.methods.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}
