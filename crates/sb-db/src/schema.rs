//! Declarative row→entity transcoding.
//!
//! Handlers select wide joined rows and hand them to `as_entity` with a
//! schema name; the schema renames columns, fills defaults for NULL or
//! missing columns, runs post-processors (bitmask → role list, hex → int,
//! …) and assembles nested sub-entities, optionally under a column-name
//! prefix.  Unknown row columns are ignored.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::DbError;

type Processor = fn(&Value) -> Value;

/// One output field of a schema.
enum Spec {
    /// Rename a column, defaulting when NULL or absent.
    Field {
        column: &'static str,
        default: Value,
    },
    /// Rename and post-process; the default runs through the processor too.
    Process {
        column: &'static str,
        default: Value,
        process: Processor,
    },
    /// Embed another schema, optionally under a column-name prefix.
    Require {
        schema: &'static str,
        prefix: Option<&'static str>,
    },
}

struct Schema {
    inherit: Option<&'static str>,
    fields: Vec<(&'static str, Spec)>,
}

struct CompiledField {
    out: &'static str,
    column: &'static str,
    default: Value,
    process: Option<Processor>,
}

struct Compiled {
    fields: Vec<CompiledField>,
    nested: Vec<(&'static str, &'static str, Option<&'static str>)>,
}

/// Transcode one row.
pub fn as_entity(
    schema: &str,
    row: &Map<String, Value>,
    prefix: Option<&str>,
) -> Result<Value, DbError> {
    let compiled = registry()
        .get(schema)
        .ok_or_else(|| DbError::UnknownSchema(schema.to_owned()))?;
    Ok(resolve(compiled, row, prefix.unwrap_or("")))
}

/// Transcode many rows through one schema.
pub fn as_entity_list(
    schema: &str,
    rows: &[Map<String, Value>],
    prefix: Option<&str>,
) -> Result<Vec<Value>, DbError> {
    let compiled = registry()
        .get(schema)
        .ok_or_else(|| DbError::UnknownSchema(schema.to_owned()))?;
    let prefix = prefix.unwrap_or("");
    Ok(rows.iter().map(|row| resolve(compiled, row, prefix)).collect())
}

fn resolve(compiled: &Compiled, row: &Map<String, Value>, prefix: &str) -> Value {
    let mut result = Map::new();
    for field in &compiled.fields {
        let column = format!("{prefix}{}", field.column);
        let value = match row.get(&column) {
            None | Some(Value::Null) => field.default.clone(),
            Some(value) => field.process.map_or_else(|| value.clone(), |p| p(value)),
        };
        result.insert(field.out.to_owned(), value);
    }
    for (out, schema, own_prefix) in &compiled.nested {
        let nested = registry()
            .get(schema)
            .unwrap_or_else(|| panic!("schema {schema} required but not defined"));
        let combined = format!("{prefix}{}", own_prefix.unwrap_or(""));
        result.insert((*out).to_owned(), resolve(nested, row, &combined));
    }
    Value::Object(result)
}

fn registry() -> &'static HashMap<&'static str, Compiled> {
    static REGISTRY: OnceLock<HashMap<&'static str, Compiled>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let raw = definitions();
        raw.iter()
            .map(|(name, schema)| (*name, compile(schema, &raw)))
            .collect()
    })
}

fn compile(schema: &Schema, all: &HashMap<&'static str, Schema>) -> Compiled {
    let mut fields: Vec<CompiledField> = Vec::new();
    let mut nested = Vec::new();

    // Single-level inheritance: parent fields first, child keys override.
    let mut layers = Vec::new();
    if let Some(parent) = schema.inherit {
        layers.push(
            all.get(parent)
                .unwrap_or_else(|| panic!("schema inherits unknown parent {parent}")),
        );
    }
    layers.push(schema);

    for layer in layers {
        for (out, spec) in &layer.fields {
            let out = *out;
            fields.retain(|field| field.out != out);
            match spec {
                Spec::Field { column, default } => fields.push(CompiledField {
                    out,
                    column: *column,
                    default: default.clone(),
                    process: None,
                }),
                Spec::Process {
                    column,
                    default,
                    process,
                } => fields.push(CompiledField {
                    out,
                    column: *column,
                    default: process(default),
                    process: Some(*process),
                }),
                Spec::Require { schema, prefix } => {
                    nested.retain(|(existing, _, _)| *existing != out);
                    nested.push((out, *schema, *prefix));
                }
            }
        }
    }
    Compiled { fields, nested }
}

// ---------------------------------------------------------------------------
// Processors
// ---------------------------------------------------------------------------

mod process {
    use super::Value;

    const CFM_ROLES: &[&str] = &["dev", "admin", "mod", "translator"];
    const TFM_ROLES: &[&str] = &[
        "admin",
        "mod",
        "sentinel",
        "mapcrew",
        "module",
        "funcorp",
        "fashion",
        "flash",
        "event",
        "discorderator",
    ];

    fn bits_of(value: &Value) -> u64 {
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(0)
    }

    fn to_roles(value: &Value, roles: &[&str]) -> Value {
        let bits = bits_of(value);
        Value::Array(
            roles
                .iter()
                .enumerate()
                .filter(|(idx, _)| bits & (1 << idx) != 0)
                .map(|(_, role)| Value::from(*role))
                .collect(),
        )
    }

    pub(super) fn cfm_roles(value: &Value) -> Value {
        to_roles(value, CFM_ROLES)
    }

    pub(super) fn tfm_roles(value: &Value) -> Value {
        to_roles(value, TFM_ROLES)
    }

    pub(super) fn as_int(value: &Value) -> Value {
        match value {
            Value::Number(_) => value.clone(),
            Value::String(s) => s.parse::<i64>().map_or(Value::from(0), Value::from),
            _ => Value::from(0),
        }
    }

    pub(super) fn from_hex(value: &Value) -> Value {
        let text = value.as_str().unwrap_or("");
        if text.is_empty() {
            return Value::from(0);
        }
        u64::from_str_radix(text, 16).map_or(Value::from(0), Value::from)
    }

    pub(super) fn as_list(value: &Value) -> Value {
        let text = value.as_str().unwrap_or("");
        if text.is_empty() {
            return Value::Array(Vec::new());
        }
        Value::Array(text.split(',').map(Value::from).collect())
    }

    pub(super) fn as_int_list(value: &Value) -> Value {
        let text = value.as_str().unwrap_or("");
        if text.is_empty() {
            return Value::Array(Vec::new());
        }
        Value::Array(
            text.split(',')
                .filter_map(|item| item.parse::<i64>().ok())
                .map(Value::from)
                .collect(),
        )
    }

    /// Normalize a stored look string to the `<fur>;<items>` shape.
    fn valid_look(look: &str) -> String {
        if look.is_empty() {
            "1;0".to_owned()
        } else if !look.contains(';') {
            format!("1;{look}")
        } else {
            look.to_owned()
        }
    }

    pub(super) fn look(value: &Value) -> Value {
        Value::from(valid_look(value.as_str().unwrap_or("")))
    }

    pub(super) fn outfits(value: &Value) -> Value {
        let text = value.as_str().unwrap_or("");
        if text.is_empty() {
            return Value::Array(Vec::new());
        }
        Value::Array(text.split('/').map(|item| Value::from(valid_look(item))).collect())
    }

    pub(super) fn gender(value: &Value) -> Value {
        match bits_of(value) {
            1 => Value::from("female"),
            2 => Value::from("male"),
            _ => Value::Null,
        }
    }

    /// Millisecond registration timestamp → `YYYY-MM`.
    pub(super) fn month(value: &Value) -> Value {
        let millis = value.as_i64().unwrap_or(0);
        chrono::DateTime::from_timestamp(millis / 1000, 0)
            .map_or(Value::Null, |when| Value::from(when.format("%Y-%m").to_string()))
    }
}

// ---------------------------------------------------------------------------
// Shipped schema set
// ---------------------------------------------------------------------------

fn definitions() -> HashMap<&'static str, Schema> {
    use Spec::{Field, Process, Require};

    fn field(column: &'static str, default: Value) -> Spec {
        Field { column, default }
    }
    fn processed(column: &'static str, default: Value, process: Processor) -> Spec {
        Process {
            column,
            default,
            process,
        }
    }
    fn require(schema: &'static str) -> Spec {
        Require {
            schema,
            prefix: None,
        }
    }
    fn require_at(schema: &'static str, prefix: &'static str) -> Spec {
        Require {
            schema,
            prefix: Some(prefix),
        }
    }

    let mut schemas = HashMap::new();

    schemas.insert(
        "BasicPlayer",
        Schema {
            inherit: None,
            fields: vec![
                ("id", field("id", Value::Null)),
                ("name", field("name", json!(""))),
                ("cfm_roles", processed("cfm_roles", json!(0), process::cfm_roles)),
                ("tfm_roles", processed("tfm_roles", json!(0), process::tfm_roles)),
            ],
        },
    );
    schemas.insert(
        "BasicTribe",
        Schema {
            inherit: None,
            fields: vec![
                ("id", field("id", Value::Null)),
                ("name", field("name", Value::Null)),
            ],
        },
    );

    schemas.insert(
        "Shop",
        Schema {
            inherit: None,
            fields: vec![
                ("look", processed("look", json!("1;0"), process::look)),
                ("outfits", processed("dress_list", json!(""), process::outfits)),
                ("mouse_color", processed("color1", json!(""), process::from_hex)),
                ("shaman_color", processed("color2", json!(""), process::from_hex)),
            ],
        },
    );

    schemas.insert(
        "TribeShamanStats",
        Schema {
            inherit: None,
            fields: vec![
                ("cheese", field("shaman_cheese", json!(0))),
                ("saves_normal", field("saved_mice", json!(0))),
                ("saves_hard", field("saved_mice_hard", json!(0))),
                ("saves_divine", field("saved_mice_divine", json!(0))),
            ],
        },
    );
    schemas.insert(
        "ShamanStats",
        Schema {
            inherit: Some("TribeShamanStats"),
            fields: vec![("experience", field("experience", json!(0)))],
        },
    );
    schemas.insert(
        "MouseStats",
        Schema {
            inherit: None,
            fields: vec![
                ("rounds", field("round_played", json!(0))),
                ("cheese", field("cheese_gathered", json!(0))),
                ("first", field("first", json!(0))),
                ("bootcamp", field("bootcamp", json!(0))),
            ],
        },
    );
    schemas.insert(
        "SurvivorStats",
        Schema {
            inherit: None,
            fields: vec![
                ("rounds", field("round_played", json!(0))),
                ("killed", field("mouse_killed", json!(0))),
                ("shaman", field("shaman_count", json!(0))),
                ("survivor", field("survivor_count", json!(0))),
            ],
        },
    );
    schemas.insert(
        "RacingStats",
        Schema {
            inherit: None,
            fields: vec![
                ("rounds", field("round_played", json!(0))),
                ("finished", field("finished_map", json!(0))),
                ("first", field("first", json!(0))),
                ("podium", field("podium", json!(0))),
            ],
        },
    );
    schemas.insert(
        "DefilanteStats",
        Schema {
            inherit: None,
            fields: vec![
                ("rounds", field("round_played", json!(0))),
                ("finished", field("finished_map", json!(0))),
                ("points", field("points", json!(0))),
            ],
        },
    );
    schemas.insert(
        "ScoreStats",
        Schema {
            inherit: None,
            fields: vec![
                ("stats", field("stats", json!(0))),
                ("shaman", field("shaman", json!(0))),
                ("survivor", field("survivor", json!(0))),
                ("racing", field("racing", json!(0))),
                ("defilante", field("defilante", json!(0))),
                ("overall", field("overall", json!(0))),
            ],
        },
    );

    schemas.insert(
        "AllStats",
        Schema {
            inherit: None,
            fields: vec![
                ("shaman", require("ShamanStats")),
                ("mouse", require("MouseStats")),
                ("survivor", require_at("SurvivorStats", "survivor_")),
                ("racing", require_at("RacingStats", "racing_")),
                ("defilante", require_at("DefilanteStats", "defilante_")),
                ("score", require_at("ScoreStats", "score_")),
            ],
        },
    );

    schemas.insert(
        "PlayerProfile",
        Schema {
            inherit: Some("BasicPlayer"),
            fields: vec![
                ("registration", processed("registration_date", json!(0), process::month)),
                ("gender", processed("id_gender", json!(0), process::gender)),
                ("title", processed("title", json!(0), process::as_int)),
                ("titles", processed("unlocked_titles", json!(""), process::as_int_list)),
                ("badges", processed("badges", json!(""), process::as_list)),
                ("tribe", require_at("BasicTribe", "tribe_")),
                ("soulmate", require_at("BasicPlayer", "sm_")),
                ("shop", require("Shop")),
                ("stats", require("AllStats")),
                ("disqualified", field("disqualified", json!(false))),
                ("can_qualify", field("can_qualify", json!(false))),
            ],
        },
    );

    schemas.insert(
        "TribeMemberCount",
        Schema {
            inherit: None,
            fields: vec![
                ("total", field("members", json!(0))),
                ("active", field("active", json!(0))),
            ],
        },
    );
    schemas.insert(
        "TribeProfile",
        Schema {
            inherit: Some("BasicTribe"),
            fields: vec![
                ("members", require("TribeMemberCount")),
                ("stats", require("AllStats")),
            ],
        },
    );

    schemas.insert(
        "Privacy",
        Schema {
            inherit: None,
            fields: vec![
                ("soulmate", field("soulmate", json!(false))),
                ("tribe", field("tribe", json!(false))),
                ("titles", field("titles", json!(true))),
                ("shaman", field("shaman", json!(true))),
                ("mouse", field("mouse", json!(true))),
                ("survivor", field("survivor", json!(true))),
                ("racing", field("racing", json!(true))),
                ("defilante", field("defilante", json!(true))),
                ("outfits", field("outfits", json!(true))),
            ],
        },
    );
    schemas.insert(
        "AccountInformation",
        Schema {
            inherit: None,
            fields: vec![
                ("player", require("BasicPlayer")),
                ("privacy", require("Privacy")),
                ("disqualified", field("disqualified", json!(false))),
                ("can_qualify", field("can_qualify", json!(false))),
                ("has_password", field("has_password", json!(false))),
            ],
        },
    );
    schemas.insert(
        "CFMDisqualificationInformation",
        Schema {
            inherit: None,
            fields: vec![
                ("moderator", require_at("BasicPlayer", "mod_")),
                ("reason", field("reason", json!(""))),
            ],
        },
    );

    schemas
}
