use crate::event::ListenerError;
use crate::host::{HostError, LoadedType};
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Observer of the retransformations done for a watch or a delete
///
/// Failures of these callbacks are logged and otherwise ignored.
pub trait Progress: Send + Sync {
    /// Retransformation is about to go over `total` types
    fn begin(&self, _total: usize) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_success(&self, _loaded: &LoadedType, _index: usize) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_failed(
        &self,
        _loaded: &LoadedType,
        _index: usize,
        _error: &HostError,
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Everything is done, having affected this many classes and methods
    fn finish(&self, _class_count: usize, _method_count: usize) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Classes and methods a watch has woven probes into
#[derive(Debug, Default)]
pub struct AffectStatistic {
    affected: Mutex<Affected>,
}

#[derive(Debug, Default)]
struct Affected {
    classes: BTreeSet<LoadedType>,
    methods: BTreeSet<(Option<i32>, String)>,
}

impl AffectStatistic {
    /// Record a woven class, along with the signature codes of its woven behaviors
    pub fn record(&self, loaded: LoadedType, behaviors: &[String]) {
        let mut affected = self.affected.lock();
        for behavior in behaviors {
            affected.methods.insert((loaded.loader, behavior.clone()));
        }
        affected.classes.insert(loaded);
    }

    pub fn class_count(&self) -> usize {
        self.affected.lock().classes.len()
    }

    pub fn method_count(&self) -> usize {
        self.affected.lock().methods.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn affected_classes_and_methods_are_unique() {
        let statistic = AffectStatistic::default();
        let calc = LoadedType::new("demo.Calc", Some(1));
        let codes = vec![String::from("demo.Calc#add(int,int)")];
        statistic.record(calc.clone(), &codes);
        statistic.record(calc, &codes);
        statistic.record(LoadedType::new("demo.Calc", Some(2)), &codes);

        assert_eq!(statistic.class_count(), 2);
        assert_eq!(statistic.method_count(), 2);
    }
}
