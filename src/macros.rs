// SPDX-License-Identifier: Apache-2.0 OR MIT
// Call-site macros

/// Log through a statically installed call site.
///
/// Expands to a process-lifetime [`CallSite`](crate::CallSite)
/// identified by `file:line`, with the enclosing module path as its
/// context, plus the fast-path conditional. Arguments are captured by
/// value and rendered with their `Display` impls, concatenated in
/// order with no separators.
///
/// # Examples
/// ```ignore
/// relog!("net", Level::Info, "connected to ", addr, ":", port);
/// ```
#[macro_export]
macro_rules! relog {
    ($tag:expr, $level:expr, $($arg:expr),+ $(,)?) => {{
        static RELOG_SITE: $crate::CallSite = $crate::CallSite::new(
            $tag,
            concat!(file!(), ":", line!()),
            module_path!(),
        );
        RELOG_SITE.log($level, |builder| builder.format(($($arg,)+)));
    }};
}

/// Like [`relog!`] with the enclosing module path as the tag.
///
/// # Examples
/// ```ignore
/// relog_here!(Level::Verbose, "tick ", n);
/// ```
#[macro_export]
macro_rules! relog_here {
    ($level:expr, $($arg:expr),+ $(,)?) => {
        $crate::relog!(module_path!(), $level, $($arg),+)
    };
}

/// Log at critical level.
///
/// # Examples
/// ```ignore
/// relog_critical!("db", "pool exhausted after ", n, " retries");
/// ```
#[macro_export]
macro_rules! relog_critical {
    ($tag:expr, $($arg:expr),+ $(,)?) => {
        $crate::relog!($tag, $crate::Level::Critical, $($arg),+)
    };
}

/// Log at error level.
#[macro_export]
macro_rules! relog_error {
    ($tag:expr, $($arg:expr),+ $(,)?) => {
        $crate::relog!($tag, $crate::Level::Error, $($arg),+)
    };
}

/// Log at warning level.
#[macro_export]
macro_rules! relog_warning {
    ($tag:expr, $($arg:expr),+ $(,)?) => {
        $crate::relog!($tag, $crate::Level::Warning, $($arg),+)
    };
}

/// Log at info level.
///
/// # Examples
/// ```ignore
/// relog_info!("startup", "listening on ", addr);
/// ```
#[macro_export]
macro_rules! relog_info {
    ($tag:expr, $($arg:expr),+ $(,)?) => {
        $crate::relog!($tag, $crate::Level::Info, $($arg),+)
    };
}

/// Log at verbose level.
#[macro_export]
macro_rules! relog_verbose {
    ($tag:expr, $($arg:expr),+ $(,)?) => {
        $crate::relog!($tag, $crate::Level::Verbose, $($arg),+)
    };
}

#[cfg(test)]
mod tests {
    use crate::global::configuration;
    use crate::level::{Level, LevelSet};
    use crate::message::Message;
    use crate::policy::{Policy, PredicatePolicy};
    use crate::sink::{sink_ref, Sink, SinkRef};
    use crate::site::CallSite;
    use std::sync::{Arc, Mutex};

    struct CaptureSink {
        lines: Arc<Mutex<Vec<String>>>,
    }

    impl Sink for CaptureSink {
        fn emit(&self, _site: &'static CallSite, message: Message) {
            self.lines.lock().unwrap().push(message.to_string());
        }
    }

    fn capture_for(tag: &'static str, priority: i32) -> (Arc<dyn Policy>, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink: SinkRef = sink_ref(CaptureSink {
            lines: Arc::clone(&lines),
        });
        let policy: Arc<dyn Policy> = Arc::new(PredicatePolicy::new(
            Some(sink),
            LevelSet::all(),
            move |site: &CallSite| site.tag() == tag,
        ));
        configuration().insert_policy(priority, policy.clone()).unwrap();
        (policy, lines)
    }

    #[test]
    fn test_relog_concatenates_arguments() {
        let (policy, lines) = capture_for("macro-basic", 110);

        relog!("macro-basic", Level::Info, "x=", 1);
        relog!("macro-basic", Level::Info, "a", "b", "c");

        assert_eq!(lines.lock().unwrap().as_slice(), ["x=1", "abc"]);
        configuration().remove_policy(110, &policy).unwrap();
    }

    #[test]
    fn test_shorthand_macros() {
        let (policy, lines) = capture_for("macro-levels", 111);

        relog_critical!("macro-levels", "c");
        relog_error!("macro-levels", "e");
        relog_warning!("macro-levels", "w");
        relog_info!("macro-levels", "i");
        relog_verbose!("macro-levels", "v");

        assert_eq!(
            lines.lock().unwrap().as_slice(),
            ["c", "e", "w", "i", "v"]
        );
        configuration().remove_policy(111, &policy).unwrap();
    }

    #[test]
    fn test_relog_here_uses_module_tag() {
        let tag = module_path!();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink: SinkRef = sink_ref(CaptureSink {
            lines: Arc::clone(&lines),
        });
        let policy: Arc<dyn Policy> = Arc::new(PredicatePolicy::new(
            Some(sink),
            LevelSet::all(),
            move |site: &CallSite| site.tag() == tag,
        ));
        configuration().insert_policy(112, policy.clone()).unwrap();

        relog_here!(Level::Info, "here");
        assert_eq!(lines.lock().unwrap().as_slice(), ["here"]);
        configuration().remove_policy(112, &policy).unwrap();
    }
}
