/// Macro to simplify creating a closure compatible with [`FnTask::new`](crate::task::FnTask::new).
///
/// Takes an optional synchronous setup block and a mandatory async body block.
/// The body must evaluate to `Result<(), TaskError>`.
///
/// # Usage
///
/// ```
/// use queuekeeper::{task_fn, task::FnTask};
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
///
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// // With setup block:
/// let task = FnTask::new("counter", task_fn! {
///     {
///         let counter = counter.clone();
///     }
///     {
///         counter.fetch_add(1, Ordering::SeqCst);
///         Ok(())
///     }
/// });
///
/// // Without setup block:
/// let noop = FnTask::new("noop", task_fn! {
///     {
///         Ok(())
///     }
/// });
/// # let _ = (task, noop);
/// ```
#[macro_export]
macro_rules! task_fn {
    // Setup block followed by the body block
    (
        { $($setup_stmts:stmt);* $(;)? }
        $main_block:block
    ) => {
        move || {
            $($setup_stmts;)*

            let fut = async move {
                let result: ::std::result::Result<(), $crate::task::TaskError> = $main_block;
                result
            };

            Box::pin(fut) as $crate::task::TaskFuture<'static>
        }
    };

    // Body block only
    (
        $main_block:block
    ) => {
         move || {
            let fut = async move {
                let result: ::std::result::Result<(), $crate::task::TaskError> = $main_block;
                result
            };

            Box::pin(fut) as $crate::task::TaskFuture<'static>
        }
    };
}
