use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep_until, Instant};

use super::{canonicalize, normalize, parse, GroupOption, OptionGroup, OptionsDocument};
use crate::config::SyncTuning;
use crate::guard::ActionGuard;

/// Guard key shared by every structural edit.
const STRUCTURE_KEY: &str = "structure";
/// Cooldown between structural edits.
const STRUCTURE_COOLDOWN: Duration = Duration::from_millis(260);

/// Child-side editor for an options document embedded in a parent record.
///
/// Changes flow both ways. Upward changes are debounced and only emitted
/// when their canonical form differs from the last canonical form seen in
/// either direction; downward syncs are only applied under the same rule.
/// The shared memo is what keeps a parent's echo of our own change from
/// being mistaken for a new one.
#[derive(Debug)]
pub struct OptionsEditor {
    doc: OptionsDocument,
    last_canonical: String,
    /// Serialized form waiting to go upward, with its due time
    pending: Option<(String, Instant)>,
    throttle: Duration,
    guard: ActionGuard,
    editable: bool,
}

impl OptionsEditor {
    pub fn new(value: &Value, tuning: &SyncTuning) -> Self {
        Self {
            doc: normalize(&parse(value).groups),
            last_canonical: canonicalize(value),
            pending: None,
            throttle: tuning.editor_throttle(),
            guard: ActionGuard::new(STRUCTURE_COOLDOWN, tuning.guard_hold_limit()),
            editable: true,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.editable = false;
        self
    }

    pub fn document(&self) -> &OptionsDocument {
        &self.doc
    }

    pub fn is_editable(&self) -> bool {
        self.editable
    }

    /// Last canonical form sent or received.
    pub fn last_canonical(&self) -> &str {
        &self.last_canonical
    }

    /// Applies a value coming from the parent.
    ///
    /// Ignored when it is canonically what we last saw. Returns true if the
    /// document was replaced.
    pub fn sync_from_parent(&mut self, value: &Value) -> bool {
        let canonical = canonicalize(value);
        if canonical == self.last_canonical {
            return false;
        }
        tracing::debug!("options replaced by parent");
        self.last_canonical = canonical;
        self.doc = normalize(&parse(value).groups);
        self.pending = None;
        true
    }

    /// Appends an empty group with one empty option.
    pub fn add_group(&mut self) -> bool {
        let doc = &mut self.doc;
        let changed = self.editable
            && self
                .guard
                .guard(STRUCTURE_KEY, || {
                    doc.groups
                        .push(OptionGroup::new("").with_option(GroupOption::new("")));
                })
                .is_some();
        self.touch_if(changed)
    }

    pub fn remove_group(&mut self, group: usize) -> bool {
        let doc = &mut self.doc;
        let changed = self.editable
            && group < doc.groups.len()
            && self
                .guard
                .guard(STRUCTURE_KEY, || {
                    doc.groups.remove(group);
                })
                .is_some();
        self.touch_if(changed)
    }

    pub fn add_option(&mut self, group: usize) -> bool {
        let doc = &mut self.doc;
        let changed = self.editable
            && group < doc.groups.len()
            && self
                .guard
                .guard(STRUCTURE_KEY, || {
                    doc.groups[group].options.push(GroupOption::new(""));
                })
                .is_some();
        self.touch_if(changed)
    }

    pub fn remove_option(&mut self, group: usize, option: usize) -> bool {
        let doc = &mut self.doc;
        let exists = doc
            .groups
            .get(group)
            .is_some_and(|g| option < g.options.len());
        let changed = self.editable
            && exists
            && self
                .guard
                .guard(STRUCTURE_KEY, || {
                    doc.groups[group].options.remove(option);
                })
                .is_some();
        self.touch_if(changed)
    }

    pub fn set_group_name(&mut self, group: usize, name: &str) -> bool {
        self.edit_group(group, |g| g.name = name.to_string())
    }

    pub fn set_selection_ids(&mut self, group: usize, ids: &str) -> bool {
        self.edit_group(group, |g| g.selection_ids = ids.to_string())
    }

    pub fn set_max_selected(&mut self, group: usize, max_selected: u32) -> bool {
        self.edit_group(group, |g| g.max_selected = max_selected)
    }

    pub fn set_required(&mut self, group: usize, required: bool) -> bool {
        self.edit_group(group, |g| g.required = required)
    }

    pub fn set_option_name(&mut self, group: usize, option: usize, name: &str) -> bool {
        self.edit_option(group, option, |o| o.name = name.to_string())
    }

    pub fn set_option_extra_value(&mut self, group: usize, option: usize, extra: f64) -> bool {
        let extra = if extra.is_finite() { extra } else { 0.0 };
        self.edit_option(group, option, |o| o.extra_value = extra)
    }

    pub fn set_option_depleted(&mut self, group: usize, option: usize, depleted: bool) -> bool {
        self.edit_option(group, option, |o| o.depleted = depleted)
    }

    /// When the pending upward change is due, if any.
    pub fn upstream_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, due)| *due)
    }

    /// Returns the change to send upward once its quiet period has passed.
    pub fn poll_upstream(&mut self) -> Option<String> {
        match &self.pending {
            Some((_, due)) if *due <= Instant::now() => self.flush(),
            _ => None,
        }
    }

    /// Returns the pending change immediately, skipping the quiet period.
    pub fn flush(&mut self) -> Option<String> {
        let (serialized, _) = self.pending.take()?;
        if serialized == self.last_canonical {
            return None;
        }
        self.last_canonical = serialized.clone();
        Some(serialized)
    }

    /// Waits for the next upward change. `None` when nothing is pending.
    pub async fn next_upstream(&mut self) -> Option<String> {
        while let Some(due) = self.upstream_deadline() {
            sleep_until(due).await;
            if let Some(serialized) = self.poll_upstream() {
                return Some(serialized);
            }
        }
        None
    }

    fn edit_group(&mut self, group: usize, f: impl FnOnce(&mut OptionGroup)) -> bool {
        let changed = match self.doc.groups.get_mut(group) {
            Some(g) if self.editable => {
                f(g);
                true
            }
            _ => false,
        };
        self.touch_if(changed)
    }

    fn edit_option(
        &mut self,
        group: usize,
        option: usize,
        f: impl FnOnce(&mut GroupOption),
    ) -> bool {
        let target = self
            .doc
            .groups
            .get_mut(group)
            .and_then(|g| g.options.get_mut(option));
        let changed = match target {
            Some(o) if self.editable => {
                f(o);
                true
            }
            _ => false,
        };
        self.touch_if(changed)
    }

    /// Restarts the quiet period with the current document.
    fn touch_if(&mut self, changed: bool) -> bool {
        if changed {
            self.pending = Some((self.doc.serialize(), Instant::now() + self.throttle));
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn editor(value: Value) -> OptionsEditor {
        OptionsEditor::new(&value, &SyncTuning::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_are_debounced() {
        let mut ed = editor(json!([{"nome": "Tamanho", "options": [{"nome": "P"}]}]));

        ed.set_option_name(0, 0, "Pe");
        tokio::time::advance(Duration::from_millis(60)).await;
        ed.set_option_name(0, 0, "Peq");
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(ed.poll_upstream(), None);

        let sent = ed.next_upstream().await.unwrap();
        assert!(sent.contains(r#""nome":"Peq""#));
        assert_eq!(ed.next_upstream().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_emit_when_canonically_unchanged() {
        let mut ed = editor(json!([{"nome": "Tamanho"}]));
        ed.set_group_name(0, "Tamanhos");
        ed.set_group_name(0, "Tamanho");
        assert_eq!(ed.next_upstream().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_echo_is_ignored() {
        let mut ed = editor(json!("[]"));
        assert!(ed.add_group());
        ed.set_group_name(0, "Molho");
        let sent = ed.next_upstream().await.unwrap();
        let uid = ed.document().groups[0].uid;

        // The parent stores what we sent and hands it back.
        assert!(!ed.sync_from_parent(&Value::String(sent)));
        assert_eq!(ed.document().groups[0].uid, uid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_change_replaces_document() {
        let mut ed = editor(json!([{"nome": "Tamanho"}]));
        assert!(!ed.sync_from_parent(&json!("[{'nome':'Tamanho'}]")));

        assert!(ed.sync_from_parent(&json!([{"nome": "Ponto"}])));
        assert_eq!(ed.document().groups[0].name, "Ponto");
        // What came down is not sent back up.
        assert_eq!(ed.flush(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_add_group_inserts_once() {
        let mut ed = editor(json!([]));
        assert!(ed.add_group());
        assert!(!ed.add_group());
        assert_eq!(ed.document().groups.len(), 1);
        assert_eq!(ed.document().groups[0].options.len(), 1);

        tokio::time::advance(Duration::from_millis(261)).await;
        assert!(ed.add_option(0));
        assert_eq!(ed.document().groups[0].options.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_edits_are_noops() {
        let mut ed = editor(json!([{"nome": "Tamanho", "options": []}]));
        assert!(!ed.set_group_name(3, "x"));
        assert!(!ed.set_option_name(0, 0, "x"));
        assert!(!ed.remove_option(0, 0));
        assert!(!ed.remove_group(1));
        assert_eq!(ed.upstream_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_rejects_edits() {
        let mut ed = editor(json!([{"nome": "Tamanho"}])).read_only();
        assert!(!ed.add_group());
        assert!(!ed.set_group_name(0, "x"));
        assert_eq!(ed.document().groups[0].name, "Tamanho");
    }

    #[tokio::test(start_paused = true)]
    async fn test_option_fields_round_trip_to_wire() {
        let mut ed = editor(json!([{"nome": "Adicionais", "options": [{"nome": "Bacon"}]}]));
        ed.set_option_extra_value(0, 0, 2.5);
        ed.set_option_depleted(0, 0, true);
        ed.set_required(0, true);
        ed.set_max_selected(0, 3);

        let sent = ed.flush().unwrap();
        assert_eq!(
            sent,
            r#"[{"nome":"Adicionais","ids":"","max_selected":3,"obrigatorio":1,"options":[{"nome":"Bacon","valor_extra":2.5,"esgotado":1}]}]"#
        );
        assert_eq!(ed.last_canonical(), sent);
    }
}
