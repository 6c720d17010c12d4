use jvm_sandbox::config::CoreConfig;
use jvm_sandbox::event::EventTypes;
use jvm_sandbox::host::{ClassPathHost, HostRuntime, LoadedType, CLASS_PATH_LOADER};
use jvm_sandbox::matcher::{Matcher, PatternFilter};
use jvm_sandbox::spy::{BridgeNames, SpyRegistry};
use jvm_sandbox::structure::StructureFactory;
use jvm_sandbox::weaver::{LoaderHierarchy, WeaveRequest, Weaver};
use jvm_sandbox::Sandbox;

use clap::{crate_version, value_parser, Arg, ArgAction, ArgMatches, Command};
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

type CliResult = Result<(), Box<dyn Error>>;

fn class_arg() -> Arg {
    Arg::new("CLASS")
        .help("Java name of the class (eg. com.example.Calc)")
        .required(true)
        .index(1)
}

fn cli() -> Command {
    Command::new("sandbox-weave")
        .version(crate_version!())
        .about("Inspects, matches, and weaves JVM class files outside of a running JVM")
        .subcommand_required(true)
        .arg(
            Arg::new("classpath")
                .long("classpath")
                .short('c')
                .value_name("DIRECTORY")
                .action(ArgAction::Append)
                .value_parser(value_parser!(PathBuf))
                .global(true)
                .help("Directory of class files (can be repeated, defaults to `.`)"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FEATURES")
                .global(true)
                .help("Engine feature string (eg. `;namespace=default;unsafe.enable=true;`)"),
        )
        .subcommand(
            Command::new("structure")
                .about("Prints the structure of a class")
                .arg(class_arg()),
        )
        .subcommand(
            Command::new("match")
                .about("Prints the behaviors of a class selected by a pattern filter")
                .arg(class_arg())
                .arg(
                    Arg::new("class pattern")
                        .long("class")
                        .value_name("PATTERN")
                        .default_value("*"),
                )
                .arg(
                    Arg::new("method pattern")
                        .long("method")
                        .value_name("PATTERN")
                        .default_value("*"),
                )
                .arg(
                    Arg::new("include subtypes")
                        .long("include-subtypes")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("weave")
                .about("Weaves probes into a class and writes the result")
                .arg(class_arg())
                .arg(
                    Arg::new("output")
                        .long("output")
                        .short('o')
                        .value_name("FILE")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("events")
                        .long("events")
                        .value_name("EVENT_TYPES")
                        .default_value("BEFORE,RETURN,THROWS"),
                )
                .arg(
                    Arg::new("method pattern")
                        .long("method")
                        .value_name("PATTERN")
                        .default_value("*"),
                )
                .arg(
                    Arg::new("listener id")
                        .long("listener-id")
                        .value_name("ID")
                        .default_value("1000")
                        .value_parser(value_parser!(i32)),
                )
                .arg(
                    Arg::new("namespace")
                        .long("namespace")
                        .value_name("NAMESPACE"),
                ),
        )
        .subcommand(
            Command::new("bridge")
                .about("Writes the bridge classes woven code calls into")
                .arg(
                    Arg::new("output")
                        .long("output")
                        .short('o')
                        .value_name("DIRECTORY")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
}

fn main() -> CliResult {
    env_logger::init();
    let matches = cli().get_matches();

    let roots: Vec<PathBuf> = match matches.get_many::<PathBuf>("classpath") {
        Some(roots) => roots.cloned().collect(),
        None => vec![PathBuf::from(".")],
    };
    let config = match matches.get_one::<String>("config") {
        Some(features) => CoreConfig::from_feature_string(features)?,
        None => CoreConfig::default(),
    };
    let host = Arc::new(ClassPathHost::new(roots));

    match matches.subcommand() {
        Some(("structure", sub)) => print_structure(config, host, sub),
        Some(("match", sub)) => print_matching(config, host, sub),
        Some(("weave", sub)) => weave(config, host, sub),
        Some(("bridge", sub)) => write_bridge(&config, sub),
        _ => Ok(()),
    }
}

fn class_name(matches: &ArgMatches) -> String {
    matches
        .get_one::<String>("CLASS")
        .cloned()
        .unwrap_or_default()
}

fn print_structure(config: CoreConfig, host: Arc<ClassPathHost>, matches: &ArgMatches) -> CliResult {
    let factory = StructureFactory::new(host, config.structure_cache_capacity);
    let loaded = LoadedType::new(class_name(matches), Some(CLASS_PATH_LOADER));
    let structure = factory
        .from_live(&loaded)
        .or_else(|_| factory.from_resource(&loaded))?;
    let metadata = structure.metadata();

    println!("{} ({:?})", structure.name(), structure.access());
    if let Some(super_name) = &metadata.super_name {
        println!("  extends {}", super_name);
    }
    for interface in &metadata.interface_names {
        println!("  implements {}", interface);
    }
    for annotation in &metadata.annotation_names {
        println!("  annotated with {}", annotation);
    }
    println!("  family:");
    for family in structure.family_types()? {
        println!("    {}", family.name());
    }
    for family in structure.family_annotation_types()? {
        println!("    @{}", family.name());
    }
    println!("  behaviors:");
    for behavior in structure.behaviors() {
        println!("    {:?} {}", behavior.access(), behavior.signature_code());
    }
    Ok(())
}

fn print_matching(config: CoreConfig, host: Arc<ClassPathHost>, matches: &ArgMatches) -> CliResult {
    let filter = PatternFilter::new(
        matches
            .get_one::<String>("class pattern")
            .cloned()
            .unwrap_or_default(),
        matches
            .get_one::<String>("method pattern")
            .cloned()
            .unwrap_or_default(),
    )
    .with_subtypes(matches.get_flag("include subtypes"));

    let sandbox = Sandbox::new(config, host, Arc::new(SpyRegistry::new()))?;
    let loaded = LoadedType::new(class_name(matches), Some(CLASS_PATH_LOADER));
    let result = sandbox.find_matching_behaviors(&loaded, &Matcher::filter(filter));
    sandbox.shutdown();

    for code in result?.signature_codes() {
        println!("{}", code);
    }
    Ok(())
}

fn weave(config: CoreConfig, host: Arc<ClassPathHost>, matches: &ArgMatches) -> CliResult {
    let name = class_name(matches);
    let event_types = EventTypes::from_names(
        matches
            .get_one::<String>("events")
            .map(String::as_str)
            .unwrap_or_default(),
    )?;
    let method_pattern = matches
        .get_one::<String>("method pattern")
        .cloned()
        .unwrap_or_default();
    let namespace = matches
        .get_one::<String>("namespace")
        .cloned()
        .unwrap_or_else(|| config.namespace.clone());
    let listener_id = matches.get_one::<i32>("listener id").copied().unwrap_or(1000);
    let weaver = Weaver::new(config.bridge_names());

    let sandbox = Sandbox::new(config, host.clone(), Arc::new(SpyRegistry::new()))?;
    let loaded = LoadedType::new(name.clone(), Some(CLASS_PATH_LOADER));
    let filter = PatternFilter::new(name.clone(), method_pattern);
    let matched = sandbox.find_matching_behaviors(&loaded, &Matcher::filter(filter));
    sandbox.shutdown();

    let request = WeaveRequest {
        namespace,
        listener_id,
        loader: loaded.loader,
        event_types,
        signature_codes: matched?.signature_codes(),
    };
    let bytes = host
        .read(&format!("{}.class", loaded.internal_name()))
        .ok_or_else(|| format!("class {} not found on the class path", name))?;
    let hierarchy = LoaderHierarchy::new(host.as_ref() as &dyn HostRuntime, loaded.loader);
    let output: &PathBuf = matches
        .get_one::<PathBuf>("output")
        .ok_or("missing output path")?;
    match weaver.weave(&bytes, &request, &hierarchy)? {
        Some(woven) => {
            for behavior in &woven.behaviors {
                log::info!("Wove {}", behavior);
            }
            fs::write(output, woven.bytes)?;
        }
        None => {
            log::warn!("Nothing in {} to weave, writing it unchanged", name);
            fs::write(output, bytes)?;
        }
    }
    Ok(())
}

fn write_bridge(config: &CoreConfig, matches: &ArgMatches) -> CliResult {
    let output: &PathBuf = matches
        .get_one::<PathBuf>("output")
        .ok_or("missing output directory")?;
    let bridge: BridgeNames = config.bridge_names();
    for (name, bytes) in bridge.generate()? {
        let path = output.join(name.resource_path());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        log::info!("Writing '{}'", path.display());
        fs::write(&path, bytes)?;
    }
    Ok(())
}
