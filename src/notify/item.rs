use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::data::{epoch, EntityName, Record, Timestamp};
use crate::Error;

const MESSAGE_LIMIT: usize = 160;

/// Which entity a notification was derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Recado,
    Material,
    ProvaTarefa,
    Nota,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 4] = [
        NotificationKind::Recado,
        NotificationKind::Material,
        NotificationKind::ProvaTarefa,
        NotificationKind::Nota,
    ];

    /// Prefix of the composite string id. Never contains a hyphen.
    pub fn prefix(&self) -> &'static str {
        match self {
            NotificationKind::Recado => "recado",
            NotificationKind::Material => "material",
            NotificationKind::ProvaTarefa => "prova_tarefa",
            NotificationKind::Nota => "nota",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }

    pub fn entity(&self) -> EntityName {
        match self {
            NotificationKind::Recado => EntityName::Recados,
            NotificationKind::Material => EntityName::Materiais,
            NotificationKind::ProvaTarefa => EntityName::ProvasTarefas,
            NotificationKind::Nota => EntityName::Notas,
        }
    }

    pub fn from_entity(entity: EntityName) -> Self {
        match entity {
            EntityName::Recados => NotificationKind::Recado,
            EntityName::Materiais => NotificationKind::Material,
            EntityName::ProvasTarefas => NotificationKind::ProvaTarefa,
            EntityName::Notas => NotificationKind::Nota,
        }
    }
}

/// Tagged notification id. Its string form is `"<prefix>-<entity id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NotificationId {
    pub kind: NotificationKind,
    pub entity_id: String,
}

impl NotificationId {
    pub fn new(kind: NotificationKind, entity_id: &str) -> Self {
        NotificationId {
            kind,
            entity_id: entity_id.to_string(),
        }
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.prefix(), self.entity_id)
    }
}

impl FromStr for NotificationId {
    type Err = Error;

    /// Splits on the first hyphen only: entity ids are UUIDs and contain
    /// hyphens of their own.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, entity_id) = s
            .split_once('-')
            .ok_or_else(|| Error::UnknownNotification(s.to_string()))?;
        let kind = NotificationKind::from_prefix(prefix)
            .ok_or_else(|| Error::UnknownNotification(s.to_string()))?;
        if entity_id.is_empty() {
            return Err(Error::UnknownNotification(s.to_string()));
        }
        Ok(NotificationId::new(kind, entity_id))
    }
}

impl Serialize for NotificationId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NotificationId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// One entry of the unified feed. Rebuilt on every refresh; `data` shares
/// the row held by the entity cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationItem {
    pub id: NotificationId,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub data: Record,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: Timestamp,
    pub read: bool,
    pub priority: Priority,
    pub category: String,
    pub icon_name: String,
    pub color: String,
}

impl NotificationItem {
    /// Composite string id, the key used by the read set
    pub fn key(&self) -> String {
        self.id.to_string()
    }

    /// Derive an item from a cached row. Rows without an id yield nothing.
    pub fn from_record(kind: NotificationKind, record: Record) -> Option<Self> {
        let entity_id = record.id()?;
        let titulo = record.get_str("titulo").unwrap_or_default().to_string();
        let disciplina = text_at(&record, &["disciplina", "nome"]);

        let (title, message, priority, category, icon_name, color, timestamp) = match kind {
            NotificationKind::Recado => {
                let conteudo = record.get_str("conteudo").unwrap_or_default();
                let message = match text_at(&record, &["autor", "nome"]) {
                    Some(autor) => format!("{}: {}", autor, conteudo),
                    None => conteudo.to_string(),
                };
                let priority = match record.get_str("prioridade") {
                    Some("alta") => Priority::High,
                    Some("baixa") => Priority::Low,
                    _ => Priority::Normal,
                };
                let title = if titulo.is_empty() {
                    "Novo recado".to_string()
                } else {
                    titulo
                };
                (title, message, priority, "recado", "megaphone", "blue", record.timestamp("created_at"))
            }
            NotificationKind::Material => {
                let descricao = record.get_str("descricao").unwrap_or_default();
                let message = match disciplina {
                    Some(disciplina) if !descricao.is_empty() => format!("{} - {}", disciplina, descricao),
                    Some(disciplina) => disciplina,
                    None => descricao.to_string(),
                };
                (
                    format!("Novo material: {}", titulo),
                    message,
                    Priority::Normal,
                    "material",
                    "book-open",
                    "green",
                    record.timestamp("created_at"),
                )
            }
            NotificationKind::ProvaTarefa => {
                let is_prova = record.get_str("tipo") == Some("prova");
                let title = if is_prova {
                    format!("Nova prova: {}", titulo)
                } else {
                    format!("Nova tarefa: {}", titulo)
                };
                let due = record
                    .timestamp("data_entrega")
                    .map(|ts| format!("{:02}/{:02}/{}", ts.day(), u8::from(ts.month()), ts.year()));
                let message = match (disciplina, due) {
                    (Some(disciplina), Some(due)) => format!("{} - entrega em {}", disciplina, due),
                    (None, Some(due)) => format!("Entrega em {}", due),
                    (Some(disciplina), None) => disciplina,
                    (None, None) => String::new(),
                };
                let priority = if is_prova { Priority::High } else { Priority::Normal };
                (title, message, priority, "avaliacao", "clipboard-list", "orange", record.timestamp("created_at"))
            }
            NotificationKind::Nota => {
                let valor = match record.get("valor") {
                    Some(JsonValue::Number(n)) => n.to_string(),
                    Some(JsonValue::String(s)) => s.clone(),
                    _ => "-".to_string(),
                };
                let origem = text_at(&record, &["avaliacao", "titulo"]).or(disciplina);
                let message = match origem {
                    Some(origem) => format!("Você recebeu {} em {}", valor, origem),
                    None => format!("Você recebeu {}", valor),
                };
                let timestamp = record
                    .timestamp("updated_at")
                    .or_else(|| record.timestamp("created_at"));
                ("Nota lançada".to_string(), message, Priority::Normal, "nota", "award", "purple", timestamp)
            }
        };

        Some(NotificationItem {
            id: NotificationId::new(kind, &entity_id),
            kind,
            title,
            message: truncate(&message, MESSAGE_LIMIT),
            data: record,
            timestamp: timestamp.unwrap_or_else(epoch),
            read: false,
            priority,
            category: category.to_string(),
            icon_name: icon_name.to_string(),
            color: color.to_string(),
        })
    }
}

fn text_at(record: &Record, path: &[&str]) -> Option<String> {
    record
        .get_path(path)
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(limit).collect();
    cut.push_str("...");
    cut
}
