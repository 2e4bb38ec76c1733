//! ProfileDocument — сохраняемый документ профиля.
//!
//! Для этого слоя доменные поля непрозрачны: `version` и `last_updated`
//! обязательны, всё остальное хранится как JSON-объект верхнего уровня.
//!
//! Сериализация детерминирована: ключи пишутся в отсортированном порядке
//! (`serde_json::Map` без preserve_order — это BTreeMap), с отступом в 2 пробела,
//! чтобы диффы между бэкапами были осмысленными.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::consts::{COLLECTION_FIELDS, DOCUMENT_VERSION};
use crate::error::{Result, StoreError};

const KEY_VERSION: &str = "version";
const KEY_LAST_UPDATED: &str = "last_updated";

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileDocument {
    pub version: String,
    pub last_updated: DateTime<Utc>,
    fields: Map<String, Value>,
}

impl Default for ProfileDocument {
    /// Минимальный документ первого запуска: версия, `now`, пустые коллекции.
    fn default() -> Self {
        let mut fields = Map::new();
        for name in COLLECTION_FIELDS {
            fields.insert(name.to_string(), Value::Array(Vec::new()));
        }
        fields.insert("personal_info".to_string(), Value::Object(Map::new()));
        Self {
            version: DOCUMENT_VERSION.to_string(),
            last_updated: Utc::now(),
            fields,
        }
    }
}

impl ProfileDocument {
    /// Пустой документ без доменных полей.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            last_updated: Utc::now(),
            fields: Map::new(),
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Типизированное чтение доменного поля. None — если поля нет.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.fields.get(key) {
            None => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|source| StoreError::Serialize {
                    what: "document field",
                    source,
                }),
        }
    }

    /// Записать доменное поле. Зарезервированные ключи (`version`,
    /// `last_updated`) сюда не попадают — у них свои поля структуры.
    /// Поля-коллекции принимают только массивы.
    pub fn set_field<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        if is_reserved(key) {
            return Err(StoreError::Serialize {
                what: "document field",
                source: serde::ser::Error::custom(format!("'{key}' is a reserved key")),
            });
        }
        let v = serde_json::to_value(value).map_err(|source| StoreError::Serialize {
            what: "document field",
            source,
        })?;
        check_field(key, &v).map_err(|reason| StoreError::InvalidDocument { reason })?;
        self.fields.insert(key.to_string(), v);
        Ok(())
    }

    /// Те же проверки, что при чтении с диска: непустая `version`,
    /// коллекции — массивы. save() не пишет то, что load() отвергнет.
    pub fn validate(&self) -> Result<()> {
        check_version(&self.version)
            .and_then(|()| {
                self.fields
                    .iter()
                    .try_for_each(|(key, value)| check_field(key, value))
            })
            .map_err(|reason| StoreError::InvalidDocument { reason })
    }

    pub fn remove_field(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Полное JSON-представление (ключи отсортированы).
    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert(KEY_VERSION.to_string(), Value::String(self.version.clone()));
        map.insert(
            KEY_LAST_UPDATED.to_string(),
            Value::String(
                self.last_updated
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
        );
        Value::Object(map)
    }

    /// Детерминированные байты для записи на диск (pretty JSON + '\n').
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = serde_json::to_vec_pretty(&self.to_value()).map_err(|source| {
            StoreError::Serialize {
                what: "profile document",
                source,
            }
        })?;
        out.push(b'\n');
        Ok(out)
    }

    /// Разобрать и провалидировать байты документа.
    /// Err(String) — человекочитаемая причина (уходит в CorruptData).
    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, String> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON: {e}"))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> std::result::Result<Self, String> {
        let Value::Object(mut map) = value else {
            return Err("top-level value must be an object".to_string());
        };

        let version = match map.remove(KEY_VERSION) {
            Some(Value::String(s)) => {
                check_version(&s)?;
                s
            }
            Some(_) => return Err("'version' must be a string".to_string()),
            None => return Err("missing 'version'".to_string()),
        };

        let last_updated = match map.remove(KEY_LAST_UPDATED) {
            Some(Value::String(s)) => parse_timestamp(&s)
                .ok_or_else(|| format!("'last_updated' is not a valid timestamp: {s}"))?,
            Some(_) => return Err("'last_updated' must be a string".to_string()),
            None => return Err("missing 'last_updated'".to_string()),
        };

        for (key, value) in &map {
            check_field(key, value)?;
        }

        Ok(Self {
            version,
            last_updated,
            fields: map,
        })
    }
}

fn is_reserved(key: &str) -> bool {
    key == KEY_VERSION || key == KEY_LAST_UPDATED
}

fn check_version(version: &str) -> std::result::Result<(), String> {
    if version.trim().is_empty() {
        return Err("'version' must not be empty".to_string());
    }
    Ok(())
}

fn check_field(key: &str, value: &Value) -> std::result::Result<(), String> {
    if COLLECTION_FIELDS.contains(&key) && !value.is_array() {
        return Err(format!("'{key}' must be an array"));
    }
    Ok(())
}

/// RFC 3339; также принимается время без смещения (трактуется как UTC),
/// как его пишут более старые инструменты.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}
