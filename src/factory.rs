//! Resource factories used by the pools to create, validate and destroy resources

use crate::errors::FactoryError;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Creates, validates and destroys the resources of a pool.
///
/// # Examples
///
/// ```
/// use prunepool::{FactoryError, ResourceFactory};
///
/// struct Sockets;
///
/// impl ResourceFactory<String> for Sockets {
///     fn create(&self) -> Result<String, FactoryError> {
///         Ok("socket".to_string())
///     }
///
///     fn is_valid(&self, resource: &String) -> bool {
///         !resource.is_empty()
///     }
/// }
/// ```
pub trait ResourceFactory<T>: Send + Sync {
    /// Create a new resource
    fn create(&self) -> Result<T, FactoryError>;

    /// Check that a resource can still be used
    fn is_valid(&self, _resource: &T) -> bool {
        true
    }

    /// Release whatever the resource holds
    fn destroy(&self, resource: T) -> Result<(), FactoryError> {
        drop(resource);
        Ok(())
    }
}

impl<T, F> ResourceFactory<T> for Arc<F>
where
    F: ResourceFactory<T> + ?Sized,
{
    fn create(&self) -> Result<T, FactoryError> {
        (**self).create()
    }

    fn is_valid(&self, resource: &T) -> bool {
        (**self).is_valid(resource)
    }

    fn destroy(&self, resource: T) -> Result<(), FactoryError> {
        (**self).destroy(resource)
    }
}

/// Factory backed by a closure
///
/// # Examples
///
/// ```
/// use prunepool::{FnFactory, ResourceFactory};
///
/// let factory = FnFactory::new(|| Ok(42u32)).with_validator(|v| *v == 42);
/// assert_eq!(factory.create().unwrap(), 42);
/// assert!(factory.is_valid(&42));
/// ```
pub struct FnFactory<T> {
    create: Box<dyn Fn() -> Result<T, FactoryError> + Send + Sync>,
    validate: Option<Box<dyn Fn(&T) -> bool + Send + Sync>>,
}

impl<T> FnFactory<T> {
    pub fn new<F>(create: F) -> Self
    where
        F: Fn() -> Result<T, FactoryError> + Send + Sync + 'static,
    {
        Self {
            create: Box::new(create),
            validate: None,
        }
    }

    pub fn with_validator<V>(mut self, validate: V) -> Self
    where
        V: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Box::new(validate));
        self
    }
}

impl<T> ResourceFactory<T> for FnFactory<T> {
    fn create(&self) -> Result<T, FactoryError> {
        (self.create)()
    }

    fn is_valid(&self, resource: &T) -> bool {
        self.validate.as_ref().is_none_or(|validate| validate(resource))
    }
}

/// Run a factory call, turning a panic into an error.
pub(crate) fn guarded<R>(call: impl FnOnce() -> Result<R, FactoryError>) -> Result<R, FactoryError> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => Err(panic_message(payload).into()),
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("factory panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("factory panicked: {msg}")
    } else {
        "factory panicked".to_string()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Hands out increasing numbers and counts what happens to them.
    #[derive(Default)]
    pub(crate) struct CountingFactory {
        pub next: AtomicUsize,
        pub created: AtomicUsize,
        pub destroyed: AtomicUsize,
        pub validated: AtomicUsize,
        pub fail_create: AtomicBool,
        pub invalid_next: AtomicUsize,
    }

    impl CountingFactory {
        pub fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        pub fn destroyed(&self) -> usize {
            self.destroyed.load(Ordering::SeqCst)
        }

        pub fn set_failing(&self, failing: bool) {
            self.fail_create.store(failing, Ordering::SeqCst);
        }

        /// Report the next `count` validated resources as invalid.
        pub fn invalidate_next(&self, count: usize) {
            self.invalid_next.store(count, Ordering::SeqCst);
        }
    }

    impl ResourceFactory<usize> for CountingFactory {
        fn create(&self) -> Result<usize, FactoryError> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err("resource unavailable".into());
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(self.next.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn is_valid(&self, _resource: &usize) -> bool {
            self.validated.fetch_add(1, Ordering::SeqCst);
            self.invalid_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        }

        fn destroy(&self, _resource: usize) -> Result<(), FactoryError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_factory_without_validator_accepts_all() {
        let factory = FnFactory::new(|| Ok("conn"));
        assert!(factory.is_valid(&"anything"));
    }

    #[test]
    fn test_guarded_catches_panic() {
        let result: Result<u32, FactoryError> = guarded(|| panic!("boom"));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
