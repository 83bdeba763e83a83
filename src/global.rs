// SPDX-License-Identifier: Apache-2.0 OR MIT
// Process-wide configuration and the bootstrap path

use std::sync::{Arc, OnceLock};

use crate::config::Configuration;
use crate::level::{Level, LevelSet};
use crate::message::Message;
use crate::policy::DefaultPolicy;
use crate::reflect::Inspect;
use crate::sink::{sink_ref, FdSink};
use crate::site::CallSite;

/// Priority of the built-in catch-all policy.
pub const DEFAULT_PRIORITY: i32 = i32::MIN;

struct Globals {
    configuration: Configuration,
    default_policy: Arc<DefaultPolicy>,
}

fn globals() -> &'static Globals {
    static GLOBALS: OnceLock<Globals> = OnceLock::new();
    GLOBALS.get_or_init(|| {
        let configuration = Configuration::new();
        let default_policy = Arc::new(DefaultPolicy::match_all(
            Some(sink_ref(FdSink::stdout())),
            LevelSet::all(),
        ));
        configuration
            .insert_policy(DEFAULT_PRIORITY, default_policy.clone())
            .expect("fresh configuration has no policies");
        Globals {
            configuration,
            default_policy,
        }
    })
}

/// The configuration that bootstrapped call sites register with.
pub fn configuration() -> &'static Configuration {
    &globals().configuration
}

/// The catch-all policy at [`DEFAULT_PRIORITY`], initially aimed at
/// standard output with every level enabled.
///
/// Reconfigure it with [`DefaultPolicy::set_sink`] /
/// [`DefaultPolicy::set_levels`] and push the change with
/// `configuration().update(DEFAULT_PRIORITY)`.
pub fn default_policy() -> &'static Arc<DefaultPolicy> {
    &globals().default_policy
}

/// First-activation path for macro-embedded call sites.
///
/// Registers the site with the global configuration so a policy
/// installed before the site ever executed takes effect on this very
/// call. The pending message is then introspected: if its first
/// captured [`Level`] element is not enabled in the site's (freshly
/// written) mask, the message is dropped. Otherwise the newly
/// installed sink, if any, receives it.
pub(crate) fn bootstrap_emit(site: &'static CallSite, message: Message) {
    if configuration().insert_site(site) {
        site.mark_registered();
    }

    let embedded = (0..message.len()).find_map(|index| {
        message
            .reflect(index)
            .and_then(|r| r.downcast_ref::<Level>().copied())
    });
    if let Some(level) = embedded {
        if !site.levels().contains(level) {
            return;
        }
    }

    if let Some(sink) = site.sink() {
        sink.emit(site, message);
    }
}
