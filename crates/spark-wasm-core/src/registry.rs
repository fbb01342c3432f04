use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::context::RootExtension;
use crate::error::RegistryError;
use crate::ids::WorkerId;
use crate::worker::{ExtensionWorker, WorkerDispatcher};

/// `ExtensionFactory` 抽象出“按工作线程创建扩展实例”的契约。
///
/// # 教案级注释
/// - **意图 (Why)**
///   - 宿主在进程加载时只登记扩展名称与工厂，每个工作线程启动时再按名称实例化，
///     取代“静态构造函数隐式注册 + 全局单例”的做法；
/// - **关键设计 (How)**
///   - 工厂以 [`WorkerId`] 参数化，返回对象安全的 [`ExtensionWorker`]，宿主适配层无需知道具体扩展类型；
///   - Trait 需满足 `Send + Sync + 'static`，以便放入进程级静态注册表。
/// - **契约说明 (What)**
///   - 每次调用都返回全新的根实例与空的请求上下文表，不同工作线程之间不共享任何状态。
pub trait ExtensionFactory: Send + Sync + 'static {
    fn create_worker(&self, name: &str, worker: WorkerId) -> Box<dyn ExtensionWorker>;
}

/// 以闭包构造根实例的工厂。
pub struct RootFactory<R, F> {
    make: F,
    _root: PhantomData<fn() -> R>,
}

impl<R, F> RootFactory<R, F>
where
    R: RootExtension,
    F: Fn(WorkerId) -> R + Send + Sync + 'static,
{
    pub fn new(make: F) -> Self {
        Self {
            make,
            _root: PhantomData,
        }
    }
}

impl<R, F> ExtensionFactory for RootFactory<R, F>
where
    R: RootExtension,
    F: Fn(WorkerId) -> R + Send + Sync + 'static,
{
    fn create_worker(&self, name: &str, worker: WorkerId) -> Box<dyn ExtensionWorker> {
        Box::new(WorkerDispatcher::new(worker, name, (self.make)(worker)))
    }
}

/// `ExtensionRegistry` 维护进程内可见的扩展目录。
///
/// # 教案级注释
/// - **目标 (Why)**
///   - 在进程加载阶段集中登记所有扩展类型，宿主通过根 ID（扩展名称）查找并实例化；
///   - 命名冲突在注册时即被捕获，而不是在工作线程启动时才暴露。
/// - **设计要点 (How)**
///   - 内部使用 `BTreeMap<String, Arc<dyn ExtensionFactory>>`，遍历顺序稳定，便于诊断输出；
///   - 注册完成后通常放入 `OnceLock` 只读共享，工作线程仅调用 [`create_worker`](Self::create_worker)。
/// - **契约 (What)**
///   - 名称区分大小写；重复注册返回 [`RegistryError::Duplicate`]；
///   - 未登记的名称返回 [`RegistryError::Unknown`]。
#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    entries: BTreeMap<String, Arc<dyn ExtensionFactory>>,
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("extensions", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册任意工厂实现。
    pub fn register_factory(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn ExtensionFactory>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::Duplicate { name });
        }
        self.entries.insert(name, factory);
        Ok(())
    }

    /// 以根实例构造闭包注册扩展。
    pub fn register<R, F>(&mut self, name: impl Into<String>, make: F) -> Result<(), RegistryError>
    where
        R: RootExtension,
        F: Fn(WorkerId) -> R + Send + Sync + 'static,
    {
        self.register_factory(name, Arc::new(RootFactory::new(make)))
    }

    /// 为工作线程实例化指定扩展。
    pub fn create_worker(
        &self,
        name: &str,
        worker: WorkerId,
    ) -> Result<Box<dyn ExtensionWorker>, RegistryError> {
        let factory = self.entries.get(name).ok_or_else(|| RegistryError::Unknown {
            name: name.to_owned(),
        })?;
        Ok(factory.create_worker(name, worker))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{RequestFilter, RootExtension};
    use crate::ids::ContextId;
    use crate::worker::RootPhase;

    struct Noop;

    struct NoopFilter;

    impl RootExtension for Noop {
        type Filter = NoopFilter;

        fn on_configure(
            &mut self,
            _cx: &crate::context::RootCx<'_>,
            _configuration_size: usize,
        ) -> Result<(), crate::error::ConfigError> {
            Ok(())
        }

        fn create_filter(&self, _context: ContextId) -> NoopFilter {
            NoopFilter
        }
    }

    impl RequestFilter<Noop> for NoopFilter {}

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ExtensionRegistry::new();
        registry.register("noop", |_| Noop).unwrap();
        assert_eq!(
            registry.register("noop", |_| Noop),
            Err(RegistryError::Duplicate {
                name: "noop".to_owned()
            })
        );
        assert!(registry.contains("noop"));
        assert!(!registry.contains("NOOP"));
    }

    #[test]
    fn workers_are_independent_instances() {
        let mut registry = ExtensionRegistry::new();
        registry.register("noop", |_| Noop).unwrap();

        let first = registry.create_worker("noop", WorkerId::new(1)).unwrap();
        let second = registry.create_worker("noop", WorkerId::new(2)).unwrap();
        assert_eq!(first.worker_id(), WorkerId::new(1));
        assert_eq!(second.worker_id(), WorkerId::new(2));
        assert_eq!(first.extension_name(), "noop");
        assert_eq!(first.phase(), RootPhase::Created);

        assert!(matches!(
            registry.create_worker("missing", WorkerId::new(3)),
            Err(RegistryError::Unknown { .. })
        ));
    }
}
