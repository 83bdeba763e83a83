// SPDX-License-Identifier: Apache-2.0 OR MIT
// Priority-ordered policy engine owning the call-site population

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::policy::{ChangeSet, Policy};
use crate::site::{CallSite, SiteRef};

/// Configuration manager for a set of call sites.
///
/// Sites are configured by the highest-priority policy that matches
/// them at any given time; at any moment a site is managed by at most
/// one policy. Because call sites emphasize fast emission, all policy
/// evaluation happens at configuration time and the results are pushed
/// into the sites' atomic sink and mask slots.
///
/// Policies are evaluated only at specific times:
///
///   - at site insertion/removal, against the site in question;
///   - at policy insertion, when the new policy may take over matching
///     sites from lower priorities (and claim unmanaged ones);
///   - at policy removal, when lower priorities may re-adopt the
///     removed policy's sites;
///   - at `rescan`, when a policy whose matching criteria changed
///     re-evaluates its own sites, releases orphans downward and
///     steals matches from below.
///
/// Update ordering: every mutation updates affected lower-priority
/// nodes first and the target node last, so a site moving between
/// policies is released by its donor before (upward moves) or ignored
/// by its donor after (downward moves) the receiver installs its sink.
///
/// All mutations are serialized under one mutex; fast paths never take
/// it.
pub struct Configuration {
    engine: Mutex<Engine>,
}

#[derive(Default)]
struct Engine {
    /// Every site ever inserted, managed or not.
    registry: HashSet<SiteRef>,
    /// Nodes keyed by priority; iteration order ascending.
    nodes: BTreeMap<i32, Node>,
}

struct Node {
    policy: Arc<dyn Policy>,
    changes: ChangeSet,
}

impl Node {
    fn new(policy: Arc<dyn Policy>) -> Self {
        Node {
            policy,
            changes: ChangeSet::new(),
        }
    }

    /// Accept matching sites from `offered`, removing them from it.
    fn adopt(&mut self, offered: &mut HashSet<SiteRef>) {
        let matched = self.policy.select(offered);
        for site in &matched {
            offered.remove(site);
        }
        self.changes.stage_insert(matched);
    }

    /// Push pending changes into the sites, if any.
    fn apply_update(&mut self) {
        if self.changes.pending() {
            self.policy.update(&self.changes);
            self.changes.apply();
        }
    }

    /// Push the full kept set into the sites even without deltas.
    fn force_update(&mut self) {
        self.policy.update(&self.changes);
        self.changes.apply();
    }
}

impl Engine {
    /// Registry sites currently claimed by no policy.
    fn unmanaged(&self) -> HashSet<SiteRef> {
        let mut set = self.registry.clone();
        for node in self.nodes.values() {
            for site in &node.changes.kept {
                set.remove(site);
            }
        }
        set
    }
}

impl Configuration {
    pub fn new() -> Self {
        Configuration {
            engine: Mutex::new(Engine::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Engine> {
        self.engine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a site, offering it to policies in priority order.
    ///
    /// The first match claims the site and immediately writes its sink
    /// and mask. Returns false if no policy matched (the site stays in
    /// the registry, disabled, and remains claimable by later policy
    /// insertions). Re-inserting a managed site is a no-op returning
    /// true.
    pub fn insert_site(&self, site: &'static CallSite) -> bool {
        let site = SiteRef::new(site);
        let mut engine = self.lock();
        engine.registry.insert(site);
        if engine
            .nodes
            .values()
            .any(|node| node.changes.kept.contains(&site))
        {
            return true;
        }

        let mut offered: HashSet<SiteRef> = std::iter::once(site).collect();
        for node in engine.nodes.values_mut().rev() {
            node.adopt(&mut offered);
            if offered.is_empty() {
                node.apply_update();
                return true;
            }
        }
        false
    }

    /// Remove a site from management; its sink is cleared.
    ///
    /// Returns false if the site was not managed.
    pub fn remove_site(&self, site: &'static CallSite) -> bool {
        let site = SiteRef::new(site);
        let mut engine = self.lock();
        engine.registry.remove(&site);
        for node in engine.nodes.values_mut().rev() {
            if node.changes.kept.contains(&site) {
                node.changes.stage_remove([site]);
                node.apply_update();
                return true;
            }
        }
        false
    }

    /// Insert a policy at `priority`, overriding lower priorities.
    ///
    /// Sites managed below that the new policy matches move to it, as
    /// do currently unmanaged sites it matches. Fails with
    /// [`Error::PriorityOccupied`] if the priority is taken.
    pub fn insert_policy(&self, priority: i32, policy: Arc<dyn Policy>) -> Result<()> {
        let mut engine = self.lock();
        if engine.nodes.contains_key(&priority) {
            return Err(Error::PriorityOccupied(priority));
        }

        let mut node = Node::new(policy);
        let mut unmanaged = engine.unmanaged();
        node.adopt(&mut unmanaged);

        // Steal matches from lower priorities; donors stage the
        // release so their update disables before ours enables.
        for lower in engine.nodes.range_mut(..priority).map(|(_, n)| n) {
            let stolen = node.policy.select(&lower.changes.kept);
            lower.changes.stage_remove(stolen.iter().copied());
            node.changes.stage_insert(stolen);
        }

        for lower in engine.nodes.range_mut(..priority).map(|(_, n)| n) {
            lower.apply_update();
        }
        node.apply_update();
        engine.nodes.insert(priority, node);
        Ok(())
    }

    /// Remove the policy at `priority`, re-homing its sites.
    ///
    /// Lower-priority policies re-adopt matching sites (highest
    /// priority first); unclaimed sites are disabled. The `policy`
    /// argument must be the instance registered at that priority.
    pub fn remove_policy(&self, priority: i32, policy: &Arc<dyn Policy>) -> Result<()> {
        let mut engine = self.lock();
        let mut node = match engine.nodes.remove(&priority) {
            Some(node) => node,
            None => return Err(Error::UnknownPriority(priority)),
        };
        if !Arc::ptr_eq(&node.policy, policy) {
            engine.nodes.insert(priority, node);
            return Err(Error::PolicyMismatch(priority));
        }

        // Offer kept sites downward. Adopted sites leave this node
        // entirely: the receiver updates first and installs its sink,
        // and this node's final update must not clobber it.
        let mut orphans: HashSet<SiteRef> = node.changes.kept.clone();
        for lower in engine.nodes.range_mut(..priority).rev().map(|(_, n)| n) {
            let adopted = lower.policy.select(&orphans);
            for site in &adopted {
                orphans.remove(site);
            }
            node.changes.forget(adopted.iter());
            lower.changes.stage_insert(adopted);
        }

        // Nobody wants the rest; disable them.
        node.changes.stage_remove(orphans);

        for lower in engine.nodes.range_mut(..priority).map(|(_, n)| n) {
            lower.apply_update();
        }
        node.apply_update();
        Ok(())
    }

    /// Re-evaluate matches for the policy at `priority`.
    ///
    /// Sites it no longer matches are offered to lower priorities (or
    /// disabled); sites below or unmanaged that it now matches are
    /// taken over. The policy's update runs unconditionally so effect
    /// changes propagate even without membership deltas.
    pub fn rescan(&self, priority: i32) -> Result<()> {
        let mut engine = self.lock();
        let mut node = match engine.nodes.remove(&priority) {
            Some(node) => node,
            None => return Err(Error::UnknownPriority(priority)),
        };

        // Split the kept set into survivors and orphans.
        let survivors: HashSet<SiteRef> =
            node.policy.select(&node.changes.kept).into_iter().collect();
        let mut orphans: HashSet<SiteRef> = node
            .changes
            .kept
            .difference(&survivors)
            .copied()
            .collect();
        node.changes.kept = survivors;

        // Claim unmanaged sites the policy now matches. The orphans
        // are spoken for below; exclude them.
        let mut unmanaged = engine.unmanaged();
        for site in node.changes.kept.iter().chain(orphans.iter()) {
            unmanaged.remove(site);
        }
        node.adopt(&mut unmanaged);

        for lower in engine.nodes.range_mut(..priority).rev().map(|(_, n)| n) {
            let adopted = lower.policy.select(&orphans);
            for site in &adopted {
                orphans.remove(site);
            }
            lower.changes.stage_insert(adopted);

            let stolen = node.policy.select(&lower.changes.kept);
            lower.changes.stage_remove(stolen.iter().copied());
            node.changes.stage_insert(stolen);
        }

        node.changes.stage_remove(orphans);

        for lower in engine.nodes.range_mut(..priority).map(|(_, n)| n) {
            lower.apply_update();
        }
        node.force_update();
        engine.nodes.insert(priority, node);
        Ok(())
    }

    /// Re-apply the policy at `priority` to its whole kept set.
    ///
    /// Used when only the policy's effect changed (new sink or mask)
    /// but not its matching. Idempotent under a fixed policy state.
    pub fn update(&self, priority: i32) -> Result<()> {
        let mut engine = self.lock();
        match engine.nodes.get_mut(&priority) {
            Some(node) => {
                node.force_update();
                Ok(())
            }
            None => Err(Error::UnknownPriority(priority)),
        }
    }

    /// Priority of the policy currently managing `site`, if any.
    pub fn manager(&self, site: &'static CallSite) -> Option<i32> {
        let site = SiteRef::new(site);
        let engine = self.lock();
        engine
            .nodes
            .iter()
            .rev()
            .find(|(_, node)| node.changes.kept.contains(&site))
            .map(|(priority, _)| *priority)
    }

    /// Apply `action` to every registered site.
    pub fn visit<F: FnMut(&'static CallSite)>(&self, mut action: F) {
        let engine = self.lock();
        for site in &engine.registry {
            action(site.get());
        }
    }

    /// Number of registered sites.
    pub fn site_count(&self) -> usize {
        self.lock().registry.len()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::{Level, LevelSet};
    use crate::message::Message;
    use crate::policy::{DefaultPolicy, PredicatePolicy, SitePredicate};
    use crate::sink::{sink_ref, Sink, SinkRef};

    struct CountingSink;

    impl Sink for CountingSink {
        fn emit(&self, _site: &'static CallSite, _message: Message) {}
    }

    fn new_sink() -> SinkRef {
        sink_ref(CountingSink)
    }

    fn leaked_site(tag: &'static str) -> &'static CallSite {
        let site = Box::leak(Box::new(CallSite::new(tag, "config.rs:0", "config::tests")));
        site.mark_registered();
        site
    }

    fn default_policy(sink: SinkRef) -> Arc<DefaultPolicy> {
        Arc::new(DefaultPolicy::match_all(Some(sink), LevelSet::all()))
    }

    fn tag_policy(
        tag: &'static str,
        sink: SinkRef,
    ) -> Arc<PredicatePolicy<impl SitePredicate>> {
        Arc::new(PredicatePolicy::new(
            Some(sink),
            LevelSet::all(),
            move |site: &CallSite| site.tag() == tag,
        ))
    }

    #[test]
    fn test_insert_site_without_policies() {
        let config = Configuration::new();
        let site = leaked_site("t");
        assert!(!config.insert_site(site));
        assert!(!site.is_enabled());
        assert_eq!(config.site_count(), 1);
    }

    #[test]
    fn test_insert_site_claims_and_configures() {
        let config = Configuration::new();
        let policy = default_policy(new_sink());
        config.insert_policy(0, policy).unwrap();

        let site = leaked_site("t");
        assert!(config.insert_site(site));
        assert!(site.is_enabled());
        assert_eq!(config.manager(site), Some(0));
    }

    #[test]
    fn test_insert_site_is_idempotent() {
        let config = Configuration::new();
        config.insert_policy(0, default_policy(new_sink())).unwrap();
        let site = leaked_site("t");
        assert!(config.insert_site(site));
        assert!(config.insert_site(site));
        assert_eq!(config.site_count(), 1);
    }

    #[test]
    fn test_remove_site_disables() {
        let config = Configuration::new();
        config.insert_policy(0, default_policy(new_sink())).unwrap();
        let site = leaked_site("t");
        config.insert_site(site);

        assert!(config.remove_site(site));
        assert!(!site.is_enabled());
        assert_eq!(config.manager(site), None);
        assert!(!config.remove_site(site));
    }

    #[test]
    fn test_priority_conflict_rejected() {
        let config = Configuration::new();
        config.insert_policy(5, default_policy(new_sink())).unwrap();
        let err = config
            .insert_policy(5, default_policy(new_sink()))
            .unwrap_err();
        assert_eq!(err, Error::PriorityOccupied(5));
    }

    #[test]
    fn test_higher_priority_steals_matching_sites() {
        let config = Configuration::new();
        let low = default_policy(new_sink());
        config.insert_policy(0, low).unwrap();

        let wanted = leaked_site("wanted");
        let other = leaked_site("other");
        config.insert_site(wanted);
        config.insert_site(other);

        let high_sink = new_sink();
        let high = tag_policy("wanted", high_sink.clone());
        config.insert_policy(10, high).unwrap();

        assert_eq!(config.manager(wanted), Some(10));
        assert_eq!(config.manager(other), Some(0));
        let installed = wanted.sink().unwrap();
        assert!(Arc::ptr_eq(&installed, &high_sink));
    }

    #[test]
    fn test_policy_insert_claims_unmanaged_sites() {
        let config = Configuration::new();
        let site = leaked_site("orphan");
        assert!(!config.insert_site(site));

        config.insert_policy(0, default_policy(new_sink())).unwrap();
        assert_eq!(config.manager(site), Some(0));
        assert!(site.is_enabled());
    }

    #[test]
    fn test_remove_policy_restores_lower_policy() {
        let config = Configuration::new();
        let low_sink = new_sink();
        let low = default_policy(low_sink.clone());
        config.insert_policy(0, low).unwrap();

        let site = leaked_site("t");
        config.insert_site(site);

        let high: Arc<dyn Policy> = tag_policy("t", new_sink());
        config.insert_policy(10, high.clone()).unwrap();
        assert_eq!(config.manager(site), Some(10));

        config.remove_policy(10, &high).unwrap();
        assert_eq!(config.manager(site), Some(0));
        let installed = site.sink().unwrap();
        assert!(Arc::ptr_eq(&installed, &low_sink));
    }

    #[test]
    fn test_remove_policy_disables_unclaimed_sites() {
        let config = Configuration::new();
        let only: Arc<dyn Policy> = default_policy(new_sink());
        config.insert_policy(0, only.clone()).unwrap();

        let site = leaked_site("t");
        config.insert_site(site);
        assert!(site.is_enabled());

        config.remove_policy(0, &only).unwrap();
        assert!(!site.is_enabled());
        assert_eq!(config.manager(site), None);
    }

    #[test]
    fn test_remove_policy_validates_instance() {
        let config = Configuration::new();
        config.insert_policy(0, default_policy(new_sink())).unwrap();
        let stranger: Arc<dyn Policy> = default_policy(new_sink());
        assert_eq!(
            config.remove_policy(0, &stranger).unwrap_err(),
            Error::PolicyMismatch(0)
        );
        assert_eq!(
            config.remove_policy(3, &stranger).unwrap_err(),
            Error::UnknownPriority(3)
        );
    }

    #[test]
    fn test_insert_then_remove_restores_prior_state() {
        let config = Configuration::new();
        let low_sink = new_sink();
        let low = default_policy(low_sink.clone());
        low.set_levels(LevelSet::of(&[Level::Info, Level::Error]));
        config.insert_policy(0, low).unwrap();

        let site = leaked_site("t");
        config.insert_site(site);
        let mask_before = site.levels();

        let high: Arc<dyn Policy> = tag_policy("t", new_sink());
        config.insert_policy(10, high.clone()).unwrap();
        config.remove_policy(10, &high).unwrap();

        assert_eq!(site.levels(), mask_before);
        assert!(Arc::ptr_eq(&site.sink().unwrap(), &low_sink));
        assert_eq!(config.manager(site), Some(0));
    }

    #[test]
    fn test_update_pushes_effect_changes() {
        let config = Configuration::new();
        let policy = default_policy(new_sink());
        config.insert_policy(0, policy.clone()).unwrap();
        let site = leaked_site("t");
        config.insert_site(site);

        policy.set_levels(LevelSet::only(Level::Critical));
        // Not yet pushed.
        assert_eq!(site.levels(), LevelSet::all());

        config.update(0).unwrap();
        assert_eq!(site.levels(), LevelSet::only(Level::Critical));

        // Idempotent under fixed policy state.
        config.update(0).unwrap();
        assert_eq!(site.levels(), LevelSet::only(Level::Critical));

        assert_eq!(config.update(99).unwrap_err(), Error::UnknownPriority(99));
    }

    #[test]
    fn test_update_with_none_sink_disables() {
        let config = Configuration::new();
        let policy = default_policy(new_sink());
        config.insert_policy(0, policy.clone()).unwrap();
        let site = leaked_site("t");
        config.insert_site(site);
        assert!(site.is_enabled());

        policy.set_sink(None);
        config.update(0).unwrap();
        assert!(!site.is_enabled());
        // Still managed; re-arming the policy re-enables.
        assert_eq!(config.manager(site), Some(0));
        policy.set_sink(Some(new_sink()));
        config.update(0).unwrap();
        assert!(site.is_enabled());
    }

    #[test]
    fn test_rescan_releases_and_steals() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let config = Configuration::new();
        let low_sink = new_sink();
        config
            .insert_policy(0, default_policy(low_sink.clone()))
            .unwrap();

        let toggled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&toggled);
        let picky_sink = new_sink();
        let picky: Arc<dyn Policy> = Arc::new(PredicatePolicy::new(
            Some(picky_sink.clone()),
            LevelSet::all(),
            move |site: &CallSite| site.tag() == "t" && flag.load(Ordering::Relaxed),
        ));
        config.insert_policy(10, picky).unwrap();

        let site = leaked_site("t");
        config.insert_site(site);
        assert_eq!(config.manager(site), Some(0));

        // Criteria change: the high policy now matches and steals.
        toggled.store(true, Ordering::Relaxed);
        config.rescan(10).unwrap();
        assert_eq!(config.manager(site), Some(10));
        assert!(Arc::ptr_eq(&site.sink().unwrap(), &picky_sink));

        // Criteria revert: the orphan falls back to the default.
        toggled.store(false, Ordering::Relaxed);
        config.rescan(10).unwrap();
        assert_eq!(config.manager(site), Some(0));
        assert!(Arc::ptr_eq(&site.sink().unwrap(), &low_sink));

        assert_eq!(config.rescan(99).unwrap_err(), Error::UnknownPriority(99));
    }

    #[test]
    fn test_rescan_disables_unclaimed_orphans() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let config = Configuration::new();
        let matching = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&matching);
        let policy: Arc<dyn Policy> = Arc::new(PredicatePolicy::new(
            Some(new_sink()),
            LevelSet::all(),
            move |_: &CallSite| flag.load(Ordering::Relaxed),
        ));
        config.insert_policy(0, policy).unwrap();

        let site = leaked_site("t");
        config.insert_site(site);
        assert!(site.is_enabled());

        matching.store(false, Ordering::Relaxed);
        config.rescan(0).unwrap();
        assert!(!site.is_enabled());
        assert_eq!(config.manager(site), None);
    }

    #[test]
    fn test_negative_priorities_order_strictly() {
        let config = Configuration::new();
        let bottom_sink = new_sink();
        config
            .insert_policy(i32::MIN, default_policy(bottom_sink))
            .unwrap();
        let mid_sink = new_sink();
        config
            .insert_policy(-5, default_policy(mid_sink.clone()))
            .unwrap();

        let site = leaked_site("t");
        config.insert_site(site);
        assert_eq!(config.manager(site), Some(-5));
        assert!(Arc::ptr_eq(&site.sink().unwrap(), &mid_sink));
    }

    #[test]
    fn test_visit_enumerates_registry() {
        let config = Configuration::new();
        config.insert_policy(0, default_policy(new_sink())).unwrap();
        let a = leaked_site("a");
        let b = leaked_site("b");
        config.insert_site(a);
        config.insert_site(b);

        let mut seen = Vec::new();
        config.visit(|site| seen.push(site.tag()));
        seen.sort_unstable();
        assert_eq!(seen, ["a", "b"]);
    }

    #[test]
    fn test_exactly_one_manager_at_all_times() {
        let config = Configuration::new();
        let low = default_policy(new_sink());
        config.insert_policy(0, low).unwrap();
        let high: Arc<dyn Policy> = tag_policy("t", new_sink());
        config.insert_policy(10, high.clone()).unwrap();

        let site = leaked_site("t");
        config.insert_site(site);

        // Enabled iff exactly one policy keeps it, at every step.
        for step in 0..3 {
            let mut owners = 0;
            if config.manager(site) == Some(0) {
                owners += 1;
            }
            if config.manager(site) == Some(10) {
                owners += 1;
            }
            assert_eq!(owners, 1, "step {step}");
            match step {
                0 => config.remove_policy(10, &high).unwrap(),
                1 => config.insert_policy(10, high.clone()).unwrap(),
                _ => {}
            }
        }
    }
}
