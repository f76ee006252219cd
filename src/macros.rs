/// Builds a closure compatible with [`BoxedExecFn`](crate::job::BoxedExecFn).
///
/// Takes an optional synchronous setup block and a mandatory async body. The
/// setup block runs each time the task is invoked, before the body's future is
/// created, which makes it the place to clone shared handles. The body must
/// evaluate to a [`TaskResult`](crate::job::TaskResult).
///
/// # Usage
///
/// ```ignore
/// # use shiftkeeper::job_fn;
/// # use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// // With setup block:
/// let task = job_fn! {
///     { let counter = counter.clone(); }
///     {
///         counter.fetch_add(1, Ordering::SeqCst);
///         Ok(())
///     }
/// };
///
/// // Body only:
/// let ping = job_fn! {
///     {
///         tracing::info!("ping");
///         Ok(())
///     }
/// };
/// ```
#[macro_export]
macro_rules! job_fn {
    (
        { $($setup_stmts:stmt);* $(;)? }
        $main_block:block
    ) => {
        move || {
            $($setup_stmts;)*

            let fut = async move {
                let result: $crate::job::TaskResult = $main_block;
                result
            };

            Box::pin(fut)
                as std::pin::Pin<Box<dyn std::future::Future<Output = $crate::job::TaskResult> + Send + 'static>>
        }
    };

    (
        $main_block:block
    ) => {
        move || {
            let fut = async move {
                let result: $crate::job::TaskResult = $main_block;
                result
            };

            Box::pin(fut)
                as std::pin::Pin<Box<dyn std::future::Future<Output = $crate::job::TaskResult> + Send + 'static>>
        }
    };
}
