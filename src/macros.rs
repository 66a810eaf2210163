/// Macro to simplify creating a [`BoxedRunFn`](crate::job::BoxedRunFn) compatible closure.
///
/// Takes an optional synchronous setup block, the closure parameters for the job
/// data and [`JobInfo`](crate::job::JobInfo), and an async body evaluating to a
/// [`RunResult`](crate::job::RunResult). Setup statements run on every invocation,
/// before the body future is created, so clones of shared state go there.
///
/// # Usage
///
/// ```ignore
/// # use jobkeeper::run_fn;
/// # use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// // With setup block:
/// let counting = run_fn! {
///     { let counter = counter.clone(); }
///     |data, info| {
///         let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
///         println!("{} run #{} with {}", info.job_name(), seen, data);
///         Ok(serde_json::json!({ "seen": seen }))
///     }
/// };
///
/// // Without setup block:
/// let simple = run_fn! {
///     |_data, _info| { Ok(serde_json::Value::Null) }
/// };
/// ```
#[macro_export]
macro_rules! run_fn {
    // Matcher 1: setup block `{...}` followed by the closure
    (
        { $($setup_stmts:stmt);* $(;)? }
        |$data:pat_param, $info:pat_param| $main_block:block
    ) => {
        Box::new(move |$data: $crate::job::JobData, $info: $crate::job::JobInfo| {
            $($setup_stmts;)*

            let fut = async move {
                let result: $crate::job::RunResult = $main_block;
                result
            };

            Box::pin(fut)
                as std::pin::Pin<Box<dyn std::future::Future<Output = $crate::job::RunResult> + Send + 'static>>
        }) as $crate::job::BoxedRunFn
    };

    // Matcher 2: only the closure
    (
        |$data:pat_param, $info:pat_param| $main_block:block
    ) => {
        Box::new(move |$data: $crate::job::JobData, $info: $crate::job::JobInfo| {
            let fut = async move {
                let result: $crate::job::RunResult = $main_block;
                result
            };

            Box::pin(fut)
                as std::pin::Pin<Box<dyn std::future::Future<Output = $crate::job::RunResult> + Send + 'static>>
        }) as $crate::job::BoxedRunFn
    };
}
