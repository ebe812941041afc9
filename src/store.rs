use crate::Result;
use crate::error::RuleError;
use crate::rule::{Rule, RuleHandle, RuleId, RuleState};
use indexmap::IndexMap;
use itertools::Itertools;
use std::collections::BTreeMap;

/// In-memory catalog of rules.
///
/// Rules live in an arena addressed by [`RuleHandle`] and are indexed by
/// (group, name). Groups keep insertion order; rules within a group are
/// sorted by name. Rules are only ever added, never removed, so handles are
/// stable until shutdown.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: Vec<Rule>,
    groups: IndexMap<String, BTreeMap<String, RuleHandle>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, h: RuleHandle) -> &Rule {
        &self.rules[h]
    }

    pub fn get_mut(&mut self, h: RuleHandle) -> &mut Rule {
        &mut self.rules[h]
    }

    /// Insert a new rule. Duplicate (group, name) pairs are rejected.
    pub fn insert(&mut self, rule: Rule) -> Result<RuleHandle> {
        let group = self.groups.entry(rule.id.group.clone()).or_default();
        if group.contains_key(&rule.id.rule) {
            return Err(RuleError::Duplicate { id: rule.id }.into());
        }
        let handle = self.rules.len();
        group.insert(rule.id.rule.clone(), handle);
        self.rules.push(rule);
        Ok(handle)
    }

    /// Exact-match lookup without template instantiation.
    pub fn find(&self, id: &RuleId) -> Option<RuleHandle> {
        self.groups.get(&id.group)?.get(&id.rule).copied()
    }

    /// Lookup with template fallback.
    ///
    /// When no exact match exists, the target group is scanned for indexed
    /// templates whose name is a prefix of the requested name; the last match
    /// wins. The template is cloned into a permanent concrete rule with the
    /// requested name, the template marker and any optional parameters
    /// cleared. Instances persist in the store until shutdown.
    pub fn lookup(&mut self, id: &RuleId) -> Option<RuleHandle> {
        if let Some(h) = self.find(id) {
            return Some(h);
        }
        let group = self.groups.get(&id.group)?;
        let template = group
            .values()
            .filter(|&&h| {
                let rule = &self.rules[h];
                rule.indexed && id.rule.starts_with(&rule.id.rule)
            })
            .last()
            .copied()?;
        let mut instance = self.rules[template].clone();
        instance.id = id.clone();
        instance.indexed = false;
        instance.optional_params = None;
        instance.proc = None;
        debug!("rule {}: instantiated from template {}", id, self.rules[template]);
        self.insert(instance).ok()
    }

    /// All handles in deterministic order: groups by insertion, rules by name.
    pub fn handles(&self) -> Vec<RuleHandle> {
        self.groups
            .values()
            .flat_map(|group| group.values().copied())
            .collect_vec()
    }

    /// Handles of every rule whose configured initial state is Active.
    pub fn active_handles(&self) -> Vec<RuleHandle> {
        self.handles()
            .into_iter()
            .filter(|&h| self.rules[h].state == RuleState::Active)
            .collect_vec()
    }

    /// Snapshot of every rule's state, indexed by handle. The scheduler
    /// evaluates RULE_COMPLETED conditions against a snapshot taken at the
    /// start of a pass so a completion only becomes visible on the next tick.
    pub fn states_snapshot(&self) -> Vec<RuleState> {
        self.rules.iter().map(|r| r.state).collect_vec()
    }

    /// Replace any prior per-invocation parameter override for the rule.
    pub fn set_optional_params(&mut self, h: RuleHandle, params: &str) {
        self.rules[h].optional_params = Some(params.to_string());
    }

    pub fn clear_optional_params(&mut self, h: RuleHandle) {
        self.rules[h].optional_params = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{
        EndCondition, FailureAction, PSEUDO_COMMAND, SchedPolicy, StartCondition, Timeout,
    };

    fn make_rule(id: &str) -> Rule {
        Rule {
            id: RuleId::parse(id).unwrap(),
            indexed: false,
            start_cond: StartCondition::None,
            end_cond: EndCondition::None,
            timeout: Timeout::Forever,
            command: PSEUDO_COMMAND.to_string(),
            params: None,
            optional_params: None,
            failure_action: FailureAction::None,
            sched: SchedPolicy::default(),
            daemon: false,
            uid: 0,
            state: RuleState::Idle,
            proc: None,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let mut store = RuleStore::new();
        let h = store.insert(make_rule("net_dhcp")).unwrap();
        assert_eq!(store.find(&RuleId::parse("net_dhcp").unwrap()), Some(h));
        assert_eq!(store.find(&RuleId::parse("net_dns").unwrap()), None);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut store = RuleStore::new();
        store.insert(make_rule("net_dhcp")).unwrap();
        let err = store.insert(make_rule("net_dhcp")).unwrap_err();
        assert!(err.to_string().contains("multiple definitions"));
    }

    #[test]
    fn test_iteration_order() {
        let mut store = RuleStore::new();
        // Groups keep insertion order; rules within a group sort by name.
        store.insert(make_rule("zeta_b")).unwrap();
        store.insert(make_rule("alpha_x")).unwrap();
        store.insert(make_rule("zeta_a")).unwrap();
        let order = store
            .handles()
            .into_iter()
            .map(|h| store.get(h).id.to_string())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["zeta_a", "zeta_b", "alpha_x"]);
    }

    #[test]
    fn test_template_instantiation() {
        let mut store = RuleStore::new();
        let mut template = make_rule("worker_");
        template.indexed = true;
        template.optional_params = Some("stale".to_string());
        store.insert(template).unwrap();

        let id = RuleId::parse("worker_3").unwrap();
        let h = store.lookup(&id).unwrap();
        let instance = store.get(h);
        assert_eq!(instance.id, id);
        assert!(!instance.indexed);
        assert!(instance.optional_params.is_none());

        // The instance is now a permanent member of the store.
        assert_eq!(store.find(&id), Some(h));
        // A second lookup returns the same instance, not a new clone.
        assert_eq!(store.lookup(&id), Some(h));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_template_longest_prefix_wins_last() {
        let mut store = RuleStore::new();
        let mut short = make_rule("worker_");
        short.indexed = true;
        short.params = Some("generic".to_string());
        store.insert(short).unwrap();
        let mut long = make_rule("worker_io");
        long.indexed = true;
        long.params = Some("io".to_string());
        store.insert(long).unwrap();

        // Both templates prefix-match; the last match in name order is used.
        let h = store.lookup(&RuleId::parse("worker_io7").unwrap()).unwrap();
        assert_eq!(store.get(h).params.as_deref(), Some("io"));
    }

    #[test]
    fn test_lookup_without_template_fails() {
        let mut store = RuleStore::new();
        store.insert(make_rule("net_dhcp")).unwrap();
        assert!(store.lookup(&RuleId::parse("net_dns").unwrap()).is_none());
        assert!(store.lookup(&RuleId::parse("other_x").unwrap()).is_none());
    }

    #[test]
    fn test_optional_params_ownership() {
        let mut store = RuleStore::new();
        let h = store.insert(make_rule("net_dhcp")).unwrap();
        store.set_optional_params(h, "eth1 -v");
        assert_eq!(store.get(h).optional_params.as_deref(), Some("eth1 -v"));
        store.set_optional_params(h, "eth2");
        assert_eq!(store.get(h).optional_params.as_deref(), Some("eth2"));
        store.clear_optional_params(h);
        assert!(store.get(h).optional_params.is_none());
    }
}
