use crate::db;
use crate::grades::{GradeField, GradingConfig};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::warn;

pub const GRADING_LIMITS_KEY: &str = "grading.limits";

const MAX_TOTAL_CEILING: f64 = 10_000.0;
const COMPONENT_MAX_CEILING: f64 = 1_000.0;

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64, min_inclusive: bool) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    let above_min = if min_inclusive { n >= min } else { n > min };
    if !above_min || n > max {
        let open = if min_inclusive { "[" } else { "(" };
        return Err(format!("{} must be in {}{}, {}]", key, open, min, max));
    }
    Ok(n)
}

pub fn merge_config_patch(config: &mut GradingConfig, patch: &Map<String, Value>) -> Result<(), String> {
    for (k, v) in patch {
        match k.as_str() {
            "maxTotal" => {
                config.max_total = parse_f64_range(v, k, 0.0, MAX_TOTAL_CEILING, false)?;
            }
            "componentMax" => {
                let obj = v
                    .as_object()
                    .ok_or_else(|| "componentMax must be an object".to_string())?;
                for (field_key, max) in obj {
                    let field = GradeField::parse(field_key)
                        .ok_or_else(|| format!("unknown grade field: {}", field_key))?;
                    config.component_max[field.index()] =
                        parse_f64_range(max, field_key, 0.0, COMPONENT_MAX_CEILING, true)?;
                }
            }
            _ => return Err(format!("unknown grading field: {}", k)),
        }
    }
    Ok(())
}

pub fn config_to_json(config: &GradingConfig) -> Value {
    let mut component_max = Map::new();
    for f in GradeField::ALL {
        component_max.insert(f.camel_key().to_string(), json!(config.max_for(f)));
    }
    json!({
        "maxTotal": config.max_total,
        "componentMax": component_max,
        "components": config.components_json(),
    })
}

/// Applies one saved entry on top of `config`; a bad entry leaves it untouched.
fn merge_saved_entry(config: &mut GradingConfig, key: &str, value: &Value) {
    let mut single = Map::new();
    single.insert(key.to_string(), value.clone());
    let mut merged = config.clone();
    match merge_config_patch(&mut merged, &single) {
        Ok(()) => *config = merged,
        Err(msg) => warn!(%key, %msg, "ignoring saved grading limit"),
    }
}

/// Defaults overlaid with whatever the workspace has saved. Saved values are
/// merged one at a time, so a single bad entry only loses that entry.
pub fn load_grading_config(conn: &Connection) -> anyhow::Result<GradingConfig> {
    let mut config = GradingConfig::default();
    let Some(raw) = db::settings_get_raw(conn, GRADING_LIMITS_KEY)? else {
        return Ok(config);
    };
    let saved: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "saved grading limits are not valid JSON, using defaults");
            return Ok(config);
        }
    };
    let Some(saved_obj) = saved.as_object() else {
        warn!("saved grading limits are not an object, using defaults");
        return Ok(config);
    };

    for (k, v) in saved_obj {
        match (k.as_str(), v.as_object()) {
            ("componentMax", Some(components)) => {
                for (field_key, max) in components {
                    let mut one = Map::new();
                    one.insert(field_key.clone(), max.clone());
                    merge_saved_entry(&mut config, k, &Value::Object(one));
                }
            }
            _ => merge_saved_entry(&mut config, k, v),
        }
    }
    Ok(config)
}

pub fn save_grading_config(conn: &Connection, config: &GradingConfig) -> anyhow::Result<()> {
    let full = config_to_json(config);
    let stored = json!({
        "maxTotal": full["maxTotal"],
        "componentMax": full["componentMax"],
    });
    db::settings_set_json(conn, GRADING_LIMITS_KEY, &stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_updates_known_fields() {
        let mut cfg = GradingConfig::default();
        let patch = json!({ "maxTotal": 120, "componentMax": { "exam": 45, "final_oral": 5 } });
        merge_config_patch(&mut cfg, patch.as_object().expect("object")).expect("merge");
        assert_eq!(cfg.max_total, 120.0);
        assert_eq!(cfg.max_for(GradeField::Exam), 45.0);
        assert_eq!(cfg.max_for(GradeField::FinalOral), 5.0);
        assert_eq!(cfg.max_for(GradeField::Writing), 15.0);
    }

    #[test]
    fn patch_rejects_bad_values() {
        let mut cfg = GradingConfig::default();
        let zero_total = json!({ "maxTotal": 0 });
        assert!(merge_config_patch(&mut cfg, zero_total.as_object().expect("object")).is_err());
        let unknown = json!({ "componentMax": { "homework": 10 } });
        assert!(merge_config_patch(&mut cfg, unknown.as_object().expect("object")).is_err());
        let extra = json!({ "rounding": 3 });
        assert!(merge_config_patch(&mut cfg, extra.as_object().expect("object")).is_err());
    }

    fn conn_with_saved(raw: &str) -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("schema");
        conn.execute(
            "INSERT INTO settings(key, value_json) VALUES(?, ?)",
            (GRADING_LIMITS_KEY, raw),
        )
        .expect("insert saved limits");
        conn
    }

    #[test]
    fn unparsable_saved_limits_fall_back_to_defaults() {
        for raw in ["{not json", "[1, 2]", "\"text\""] {
            let conn = conn_with_saved(raw);
            let cfg = load_grading_config(&conn).expect("load");
            assert_eq!(cfg.max_total, 100.0, "raw {raw}");
            assert_eq!(cfg.max_for(GradeField::Exam), 25.0, "raw {raw}");
        }
    }

    #[test]
    fn saved_limits_merge_per_entry() {
        let conn = conn_with_saved(
            r#"{"maxTotal":120,"componentMax":{"exam":"bad","writing":20,"homework":5},"rounding":3}"#,
        );
        let cfg = load_grading_config(&conn).expect("load");
        assert_eq!(cfg.max_total, 120.0);
        assert_eq!(cfg.max_for(GradeField::Exam), 25.0);
        assert_eq!(cfg.max_for(GradeField::Writing), 20.0);

        let conn = conn_with_saved(r#"{"maxTotal":-1,"componentMax":{"exam":30}}"#);
        let cfg = load_grading_config(&conn).expect("load");
        assert_eq!(cfg.max_total, 100.0);
        assert_eq!(cfg.max_for(GradeField::Exam), 30.0);
    }

    #[test]
    fn missing_saved_limits_use_defaults() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("schema");
        let cfg = load_grading_config(&conn).expect("load");
        assert_eq!(cfg.max_total, 100.0);
    }
}
