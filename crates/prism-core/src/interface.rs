//! Checked downcasting from RHI trait objects to backend types.

use std::any::Any;
use std::sync::Arc;

/// Access to the concrete type behind an RHI trait object.
///
/// Every object trait inherits this, so backend code can recover its own
/// type from an `Arc<dyn Resource>` handed back by the caller. Implement it
/// with [`impl_query_interface!`](crate::impl_query_interface).
pub trait QueryInterface: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Implement [`QueryInterface`] for one or more concrete types.
#[macro_export]
macro_rules! impl_query_interface {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::interface::QueryInterface for $ty {
                fn as_any(&self) -> &dyn ::std::any::Any {
                    self
                }

                fn into_any(
                    self: ::std::sync::Arc<Self>,
                ) -> ::std::sync::Arc<dyn ::std::any::Any + Send + Sync> {
                    self
                }
            }
        )+
    };
}

/// Borrow `object` as `T`.
///
/// Handing an object from one backend to another is a contract violation.
pub fn cast<T: Any>(object: &dyn Any) -> &T {
    match object.downcast_ref::<T>() {
        Some(concrete) => concrete,
        None => crate::contract_violation!(
            "object is not a {}; objects from different backends cannot be mixed",
            std::any::type_name::<T>()
        ),
    }
}

/// Convert a shared object into its concrete type.
pub fn cast_arc<T: Any + Send + Sync>(object: Arc<dyn Any + Send + Sync>) -> Arc<T> {
    match object.downcast::<T>() {
        Ok(concrete) => concrete,
        Err(_) => crate::contract_violation!(
            "object is not a {}; objects from different backends cannot be mixed",
            std::any::type_name::<T>()
        ),
    }
}

/// Identity comparison of two shared objects, ignoring vtable metadata.
pub fn same_object<T: ?Sized, U: ?Sized>(a: &Arc<T>, b: &Arc<U>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Shape: QueryInterface {
        fn sides(&self) -> u32;
    }

    struct Triangle;
    struct Square;

    impl Shape for Triangle {
        fn sides(&self) -> u32 {
            3
        }
    }

    impl Shape for Square {
        fn sides(&self) -> u32 {
            4
        }
    }

    crate::impl_query_interface!(Triangle, Square);

    #[test]
    fn cast_recovers_concrete_type() {
        let shape: Arc<dyn Shape> = Arc::new(Triangle);
        let triangle: &Triangle = cast(shape.as_any());
        assert_eq!(triangle.sides(), 3);

        let owned: Arc<Triangle> = cast_arc(shape.clone().into_any());
        assert!(same_object(&owned, &shape));
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn cast_to_wrong_type_is_fatal() {
        let shape: Arc<dyn Shape> = Arc::new(Square);
        let _ = cast::<Triangle>(shape.as_any());
    }

    #[test]
    fn distinct_objects_are_not_same() {
        let a: Arc<dyn Shape> = Arc::new(Square);
        let b: Arc<dyn Shape> = Arc::new(Square);
        assert!(!same_object(&a, &b));
        assert!(same_object(&a, &a.clone()));
    }
}
