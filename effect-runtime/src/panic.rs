//! Defects and Panic Capture
//!
//! A panic raised by user code running inside a fiber never unwinds through
//! the scheduler. The run loop catches it and turns it into a [`Defect`],
//! which then travels through the fiber as a `Cause::Die`.
//!
//! # Panic Hook
//!
//! [`install_panic_hook`] chains a hook in front of the process-wide one.
//! While a fiber is evaluating user code the hook only records the panic
//! location, so captured panics do not spam stderr. Panics outside fibers
//! are forwarded to the previous hook unchanged.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

/// Counter for panics seen by the hook.
static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

static HOOK: Once = Once::new();

thread_local! {
    /// Set while [`catch`] is evaluating user code on this thread.
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    /// Location of the most recent captured panic on this thread.
    static LAST_LOCATION: RefCell<Option<Location>> = const { RefCell::new(None) };
}

/// Source location information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// File name.
    pub file: String,
    /// Line number.
    pub line: u32,
    /// Column number.
    pub column: u32,
}

impl Location {
    fn from_std(location: &panic::Location<'_>) -> Self {
        Self {
            file: location.file().to_string(),
            line: location.line(),
            column: location.column(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// An unexpected, unrecoverable failure.
///
/// Defects are produced by panics inside fiber code, by [`Effect::die`],
/// and by finalizers that fail. They are never caught by typed error
/// handlers, only by cause-level combinators.
///
/// [`Effect::die`]: crate::effect::Effect::die
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defect {
    message: String,
    location: Option<Location>,
}

impl Defect {
    /// Create a defect located at the caller.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: Some(Location::from_std(panic::Location::caller())),
        }
    }

    /// Create a defect from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>, location: Option<Location>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Self { message, location }
    }

    /// The panic or failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Where the defect was raised, if known.
    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at {}", self.message, location),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Defect {}

/// Install the capturing panic hook. Idempotent.
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            PANIC_COUNT.fetch_add(1, Ordering::Relaxed);
            if CAPTURING.with(Cell::get) {
                let location = info.location().map(Location::from_std);
                LAST_LOCATION.with(|last| *last.borrow_mut() = location);
            } else {
                previous(info);
            }
        }));
    });
}

/// Number of panics observed since the hook was installed.
pub fn panic_count() -> u64 {
    PANIC_COUNT.load(Ordering::Relaxed)
}

/// Run `f`, converting a panic into a [`Defect`].
pub(crate) fn catch<T>(f: impl FnOnce() -> T) -> Result<T, Defect> {
    let was_capturing = CAPTURING.with(|c| c.replace(true));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    CAPTURING.with(|c| c.set(was_capturing));
    result.map_err(|payload| {
        let location = LAST_LOCATION.with(|last| last.borrow_mut().take());
        Defect::from_panic(payload, location)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defect_new_records_caller() {
        let defect = Defect::new("boom");
        assert_eq!(defect.message(), "boom");
        let location = defect.location().expect("caller location");
        assert!(location.file.ends_with("panic.rs"));
    }

    #[test]
    fn test_catch_returns_value() {
        assert_eq!(catch(|| 21 * 2), Ok(42));
    }

    #[test]
    fn test_catch_converts_str_panic() {
        install_panic_hook();
        let defect = catch(|| -> u32 { panic!("exploded") }).unwrap_err();
        assert_eq!(defect.message(), "exploded");
        assert!(defect.location().is_some());
    }

    #[test]
    fn test_catch_converts_formatted_panic() {
        install_panic_hook();
        let defect = catch(|| -> u32 { panic!("value was {}", 7) }).unwrap_err();
        assert_eq!(defect.message(), "value was 7");
    }

    #[test]
    fn test_nested_catch_restores_capture_flag() {
        install_panic_hook();
        let outer = catch(|| {
            let inner = catch(|| -> () { panic!("inner") });
            assert!(inner.is_err());
            CAPTURING.with(Cell::get)
        });
        assert_eq!(outer, Ok(true));
        assert!(!CAPTURING.with(Cell::get));
    }

    #[test]
    fn test_display_includes_location() {
        let defect = Defect::from_panic(
            Box::new("bad"),
            Some(Location {
                file: "lib.rs".into(),
                line: 3,
                column: 9,
            }),
        );
        assert_eq!(defect.to_string(), "bad at lib.rs:3:9");
    }
}
