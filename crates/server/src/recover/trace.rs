//! Bounded stack traces for the operator log.
//!
//! Failures carry the stack of the point they were raised at: errors capture
//! it when they convert into a [`Failure`], panics through a chained panic
//! hook. Rendering drops the innermost frames that belong to the capture
//! itself, so the first frame printed is the code that failed.

use std::backtrace::Backtrace;
use std::cell::Cell;
use std::fmt::{Display, Write};
use std::panic;
use std::sync::Once;

use super::Failure;

/// Frames kept after skipping the capture machinery.
pub(crate) const MAX_FRAMES: usize = 20;

/// Frame prefixes that belong to capturing or converting a failure rather
/// than to the code that raised it. Matched after a leading `<`.
const MACHINERY: [&str; 10] = [
    "std::",
    "core::",
    "alloc::",
    "T as core::",
    "rust_begin_unwind",
    "__rust",
    concat!(env!("CARGO_CRATE_NAME"), "::recover::trace::"),
    concat!(env!("CARGO_CRATE_NAME"), "::recover::failure::Failure"),
    concat!(env!("CARGO_CRATE_NAME"), "::recover::Recovery::"),
    concat!(env!("CARGO_CRATE_NAME"), "::recover::invoke"),
];

thread_local! {
    static PANIC_TRACE: Cell<Option<Backtrace>> = const { Cell::new(None) };
}

/// Chains a panic hook that keeps the panicking thread's stack for
/// [`take_panic_trace`]. Installed once per process.
pub(crate) fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let _ = PANIC_TRACE.try_with(|slot| slot.set(Some(Backtrace::force_capture())));
            previous(info);
        }));
    });
}

/// The stack of the last panic on this thread, if the hook saw it.
pub(crate) fn take_panic_trace() -> Option<Backtrace> {
    PANIC_TRACE.try_with(Cell::take).ok().flatten()
}

/// Renders `failure`, its chain of causes and the stack it was raised with.
/// Failures without a stored stack get the one of the caller.
pub(crate) fn report(failure: &Failure) -> String {
    let mut headline = failure.to_string();
    for cause in failure.causes() {
        let _ = write!(headline, "\n  caused by: {cause}");
    }
    match failure.backtrace() {
        Some(backtrace) => render(&headline, &backtrace.to_string(), MAX_FRAMES),
        None => render(&headline, &Backtrace::force_capture().to_string(), MAX_FRAMES),
    }
}

/// Renders `value` followed by at most `max` frames of `backtrace`, leaving
/// out the leading frames of the capture machinery.
///
/// `backtrace` is the `Display` output of [`Backtrace`]: each frame starts
/// with an index line (`  3: path::to::fn`) optionally followed by an
/// `at file:line` line.
pub(crate) fn render(value: &dyn Display, backtrace: &str, max: usize) -> String {
    let mut out = format!("recovered: {value}");
    let mut frames = 0;
    let origin = split_frames(backtrace).into_iter().skip_while(|frame| is_machinery(frame.function));
    for frame in origin.take(max) {
        frames += 1;
        let _ = write!(out, "\n    {}", frame.function);
        if let Some(location) = frame.location {
            let _ = write!(out, "\n        {location}");
        }
    }
    if frames == 0 {
        out.push_str("\n    <no frames captured>");
    }
    out
}

fn is_machinery(function: &str) -> bool {
    let function = function.strip_prefix('<').unwrap_or(function);
    MACHINERY.iter().any(|prefix| function.starts_with(prefix))
}

struct Frame<'a> {
    function: &'a str,
    location: Option<&'a str>,
}

fn split_frames(backtrace: &str) -> Vec<Frame<'_>> {
    let mut frames: Vec<Frame<'_>> = Vec::new();
    for line in backtrace.lines() {
        let line = line.trim();
        if let Some(function) = frame_function(line) {
            frames.push(Frame { function, location: None });
        } else if let Some(location) = line.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                frame.location = Some(location);
            }
        }
    }
    frames
}

fn frame_function(line: &str) -> Option<&str> {
    let (index, function) = line.split_once(": ")?;
    (!index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())).then_some(function)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const RAISED: &str = indoc! {"
           0: std::backtrace::Backtrace::force_capture
                     at /rustc/library/std/src/backtrace.rs:312:9
           1: <suna::recover::failure::Failure as core::convert::From<E>>::from
                     at ./src/recover/failure.rs:201:20
           2: <core::result::Result<T,F> as core::ops::try_trait::FromResidual<core::result::Result<core::convert::Infallible,E>>>::from_residual
           3: app::handler::create_user::{{closure}}
                     at ./src/handler.rs:40:9
           4: suna::server::Server::handle::{{closure}}
           5: tokio::runtime::task::core::Core<T,S>::poll
    "};

    const PANICKED: &str = indoc! {"
           0: std::backtrace::Backtrace::force_capture
           1: suna::recover::trace::install_panic_hook::{{closure}}::{{closure}}
           2: <alloc::boxed::Box<F,A> as core::ops::function::Fn<Args>>::call
           3: std::panicking::rust_panic_with_hook
           4: std::panicking::begin_panic_handler::{{closure}}
           5: std::sys::backtrace::__rust_end_short_backtrace
           6: __rustc::rust_begin_unwind
           7: core::panicking::panic_fmt
           8: app::handler::load_config
                     at ./src/handler.rs:12:5
    "};

    #[test]
    fn starts_at_the_raising_frame() {
        let text = render(&"db down", RAISED, 20);
        let expected = indoc! {"
            recovered: db down
                app::handler::create_user::{{closure}}
                    ./src/handler.rs:40:9
                suna::server::Server::handle::{{closure}}
                tokio::runtime::task::core::Core<T,S>::poll"};
        assert_eq!(text, expected);
    }

    #[test]
    fn panic_hook_frames_are_skipped() {
        let text = render(&"panicked: boom", PANICKED, 20);
        assert_eq!(text, "recovered: panicked: boom\n    app::handler::load_config\n        ./src/handler.rs:12:5");
    }

    #[test]
    fn caps_frame_count() {
        let text = render(&"boom", RAISED, 2);
        assert!(text.contains("create_user"));
        assert!(text.contains("Server::handle"));
        assert!(!text.contains("Core<T,S>::poll"));
    }

    #[test]
    fn empty_backtrace() {
        assert_eq!(render(&"boom", "disabled backtrace", 20), "recovered: boom\n    <no frames captured>");
    }

    #[test]
    fn panic_trace_is_taken_once() {
        install_panic_hook();
        let caught = panic::catch_unwind(|| panic!("kept"));
        assert!(caught.is_err());
        assert!(take_panic_trace().is_some());
        assert!(take_panic_trace().is_none());
    }
}
