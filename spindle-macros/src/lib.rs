#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Entry point attributes for the spindle task processor.

mod entry;
mod parse;

/// Runs the function body as a task on a freshly built `TaskProcessor`.
///
/// The body stays a plain synchronous function. It runs on a coroutine, so
/// it may block on spindle primitives, spawn tasks and join them. The
/// processor is shut down once the body returns.
///
/// # Options
///
/// - `worker_threads = N` sets the number of worker threads. Defaults to the
///   number of CPUs.
/// - `name = "..."` names the processor and prefixes its thread names.
///
/// # Usage
///
/// ```no_run
/// #[spindle::main(worker_threads = 4)]
/// fn main() {
///     let task = spindle::spawn(|| 40 + 2);
///     println!("{}", task.get().unwrap());
/// }
/// ```
///
/// Equivalent code not using `#[spindle::main]`
///
/// ```no_run
/// fn main() {
///     spindle::runtime::Builder::new()
///         .worker_threads(4)
///         .try_build()
///         .unwrap()
///         .block_on(|| {
///             let task = spindle::spawn(|| 40 + 2);
///             println!("{}", task.get().unwrap());
///         })
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Runs a test body as a task on its own `TaskProcessor`.
///
/// Each test gets a separate processor with a single worker thread unless
/// `worker_threads` says otherwise. The body may return a `Result`, which is
/// handed back to the test harness unchanged.
///
/// ```no_run
/// #[spindle::test(worker_threads = 2)]
/// fn my_test() -> anyhow::Result<()> {
///     let task = spindle::spawn(|| 1);
///     assert_eq!(task.get()?, 1);
///     Ok(())
/// }
/// ```
///
/// Equivalent code not using `#[spindle::test]`
///
/// ```no_run
/// #[test]
/// fn my_test() -> anyhow::Result<()> {
///     spindle::runtime::Builder::new()
///         .worker_threads(2)
///         .try_build()
///         .unwrap()
///         .block_on(|| -> anyhow::Result<()> {
///             let task = spindle::spawn(|| 1);
///             assert_eq!(task.get()?, 1);
///             Ok(())
///         })
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
