use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Alternate fetch/snapshot pair used by one staff role.
///
/// The server delivers the same collection under a second event name,
/// typically pre-filtered for that role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleVariant {
    pub role: String,
    pub fetch_event: String,
    pub snapshot_event: String,
    /// Value of `emitir` on fetches
    pub broadcast: bool,
    /// Category this role works with, applied as a default view filter
    pub category: Option<String>,
}

/// Wire description of one server-owned collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionKind {
    pub name: String,
    pub fetch_event: String,
    pub snapshot_event: String,
    /// Field of the snapshot object that holds the records
    pub payload_key: String,
    pub variant: Option<RoleVariant>,
}

impl CollectionKind {
    pub fn new(
        name: impl Into<String>,
        fetch_event: impl Into<String>,
        snapshot_event: impl Into<String>,
        payload_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            fetch_event: fetch_event.into(),
            snapshot_event: snapshot_event.into(),
            payload_key: payload_key.into(),
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: RoleVariant) -> Self {
        self.variant = Some(variant);
        self
    }

    /// Order items. The kitchen gets its own broadcast feed of category 3.
    pub fn orders() -> Self {
        Self::new("orders", "getPedidos", "respostaPedidos", "dataPedidos").with_variant(
            RoleVariant {
                role: "Cozinha".to_string(),
                fetch_event: "getPedidosCC".to_string(),
                snapshot_event: "respostaPedidosCC".to_string(),
                broadcast: true,
                category: Some("3".to_string()),
            },
        )
    }

    pub fn users() -> Self {
        Self::new("users", "users", "usuarios", "users")
    }

    /// Change log of edits made by staff.
    pub fn audit() -> Self {
        Self::new("audit", "getAlteracoes", "respostaAlteracoes", "alteracoes")
    }

    pub fn stock() -> Self {
        Self::new("stock", "getEstoque", "respostaEstoque", "dataEstoque")
    }

    pub fn general_stock() -> Self {
        Self::new(
            "general-stock",
            "getEstoqueGeral",
            "respostaEstoqueGeral",
            "dataEstoqueGeral",
        )
    }

    /// Looks up a built-in kind by name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "orders" => Some(Self::orders()),
            "users" => Some(Self::users()),
            "audit" => Some(Self::audit()),
            "stock" => Some(Self::stock()),
            "general-stock" => Some(Self::general_stock()),
            _ => None,
        }
    }

    pub fn builtin_names() -> &'static [&'static str] {
        &["orders", "users", "audit", "stock", "general-stock"]
    }

    /// The variant that applies to `role`, if any.
    pub fn variant_for(&self, role: &str) -> Option<&RoleVariant> {
        self.variant.as_ref().filter(|v| v.role == role)
    }

    pub fn fetch_event_for(&self, role: &str) -> &str {
        self.variant_for(role)
            .map(|v| v.fetch_event.as_str())
            .unwrap_or(&self.fetch_event)
    }

    /// Fetch payload without context fields.
    pub fn fetch_payload(&self, role: &str) -> Value {
        let broadcast = self.variant_for(role).map(|v| v.broadcast).unwrap_or(false);
        json!({ "emitir": broadcast })
    }

    /// Every event name a snapshot of this collection may arrive under.
    pub fn snapshot_events(&self) -> Vec<&str> {
        let mut events = vec![self.snapshot_event.as_str()];
        if let Some(variant) = &self.variant {
            if variant.snapshot_event != self.snapshot_event {
                events.push(variant.snapshot_event.as_str());
            }
        }
        events
    }

    /// Default category filter for views shown to `role`.
    pub fn category_for(&self, role: &str) -> Option<&str> {
        self.variant_for(role).and_then(|v| v.category.as_deref())
    }
}
