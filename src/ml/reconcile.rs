// ============================================================
// Layer 5: Checkpoint Reconciler
// ============================================================
// Merges the hyperparameter map saved in a checkpoint with the
// hyperparameters of the current configuration.
//
// Precedence (one row per serialized field):
//
//   field                         source
//   ────────────────────────────  ──────────
//   dim_model .. max_charge       checkpoint   (weight shapes)
//   max_length .. calc_precision  config       (behavior)
//
// Legacy names are migrated before the merge: the value moves
// to the current name, the legacy key is dropped and the caller
// gets a deprecation notice. When both names are present the
// current one wins.
//
// A migrated value is taken from the checkpoint even for a
// config-sourced field, since it was set explicitly when the
// model was trained. If it differs from the config the caller
// gets an override notice for the current name.
//
// A checkpoint without any map falls back to the configuration
// entirely; the caller decides how to report that.

use std::fmt;

use crate::domain::error::Result;
use crate::ml::hparams::{HparamMap, Hyperparameters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    Checkpoint,
    Config,
}

/// Where every serialized field is taken from.
pub const PRECEDENCE: &[(&str, FieldSource)] = &[
    ("dim_model", FieldSource::Checkpoint),
    ("n_head", FieldSource::Checkpoint),
    ("dim_feedforward", FieldSource::Checkpoint),
    ("n_layers", FieldSource::Checkpoint),
    ("dropout", FieldSource::Checkpoint),
    ("dim_intensity", FieldSource::Checkpoint),
    ("residues", FieldSource::Checkpoint),
    ("max_charge", FieldSource::Checkpoint),
    ("max_length", FieldSource::Config),
    ("precursor_mass_tol", FieldSource::Config),
    ("isotope_error_range", FieldSource::Config),
    ("n_beams", FieldSource::Config),
    ("min_peptide_len", FieldSource::Config),
    ("top_match", FieldSource::Config),
    ("n_log", FieldSource::Config),
    ("tb_summarywriter", FieldSource::Config),
    ("train_label_smoothing", FieldSource::Config),
    ("warmup_iters", FieldSource::Config),
    ("cosine_schedule_period_iters", FieldSource::Config),
    ("lr", FieldSource::Config),
    ("weight_decay", FieldSource::Config),
    ("calculate_precision", FieldSource::Config),
];

/// (legacy name, current name)
pub const LEGACY_FIELDS: &[(&str, &str)] = &[("max_iters", "cosine_schedule_period_iters")];

/// Where the reconciled hyperparameters came from as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HparamSource {
    Merged,
    /// The checkpoint carried no map.
    ConfigOnly,
}

/// An architecture field whose checkpoint value differs from the config.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub field: String,
    pub checkpoint: serde_json::Value,
    pub config: serde_json::Value,
}

impl fmt::Display for Override {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mismatching {} parameter in model checkpoint ({}) vs config file ({}); \
             using the checkpoint.",
            self.field, self.checkpoint, self.config
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub hparams: Hyperparameters,
    pub source: HparamSource,
    /// Legacy field names found (and migrated) in the checkpoint map.
    pub deprecated: Vec<String>,
    pub overridden: Vec<Override>,
}

/// Move legacy keys to their current names. Returns the legacy names seen.
pub fn migrate_legacy(map: &mut HparamMap) -> Vec<String> {
    let mut seen = Vec::new();
    for &(legacy, current) in LEGACY_FIELDS {
        if let Some(value) = map.remove(legacy) {
            map.entry(current.to_string()).or_insert(value);
            seen.push(legacy.to_string());
        }
    }
    seen
}

pub fn reconcile(saved: Option<&HparamMap>, config: &Hyperparameters) -> Result<Reconciled> {
    let Some(saved) = saved else {
        return Ok(Reconciled {
            hparams: config.clone(),
            source: HparamSource::ConfigOnly,
            deprecated: Vec::new(),
            overridden: Vec::new(),
        });
    };

    // Current names that will receive a legacy value.
    let migrated: Vec<&str> = LEGACY_FIELDS
        .iter()
        .filter(|(legacy, current)| saved.contains_key(*legacy) && !saved.contains_key(*current))
        .map(|&(_, current)| current)
        .collect();

    let mut saved = saved.clone();
    let deprecated = migrate_legacy(&mut saved);

    let mut merged = config.to_map()?;
    let mut overridden = Vec::new();
    for &(field, source) in PRECEDENCE {
        if source != FieldSource::Checkpoint && !migrated.contains(&field) {
            continue;
        }
        let Some(value) = saved.get(field) else {
            tracing::debug!("Checkpoint map has no '{}'; keeping the config value", field);
            continue;
        };
        if let Some(current) = merged.get(field) {
            if current != value {
                overridden.push(Override {
                    field: field.to_string(),
                    checkpoint: value.clone(),
                    config: current.clone(),
                });
            }
        }
        merged.insert(field.to_string(), value.clone());
    }

    for key in saved.keys() {
        if !PRECEDENCE.iter().any(|(f, _)| f == key) {
            tracing::debug!("Ignoring unknown checkpoint hyperparameter '{}'", key);
        }
    }

    Ok(Reconciled {
        hparams: Hyperparameters::from_map(&merged)?,
        source: HparamSource::Merged,
        deprecated,
        overridden,
    })
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn saved_with(edit: impl FnOnce(&mut Hyperparameters)) -> HparamMap {
        let mut hp = Hyperparameters::default();
        edit(&mut hp);
        hp.to_map().unwrap()
    }

    #[test]
    fn test_table_covers_every_field_once() {
        let keys: BTreeSet<String> = Hyperparameters::default().to_map().unwrap().into_keys().collect();
        let table: Vec<&str> = PRECEDENCE.iter().map(|(f, _)| *f).collect();
        let unique: BTreeSet<&str> = table.iter().copied().collect();
        assert_eq!(unique.len(), table.len(), "duplicate row in the precedence table");
        assert_eq!(
            unique,
            keys.iter().map(String::as_str).collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn test_architecture_from_checkpoint_behavior_from_config() {
        let saved = saved_with(|hp| {
            hp.architecture.n_layers = 1;
            hp.behavior.n_beams = 3;
        });
        let mut config = Hyperparameters::default();
        config.architecture.n_layers = 50;
        config.behavior.n_beams = 12;
        config.behavior.cosine_schedule_period_iters = 2;

        let r = reconcile(Some(&saved), &config).unwrap();
        assert_eq!(r.source, HparamSource::Merged);
        assert_eq!(r.hparams.architecture.n_layers, 1);
        assert_eq!(r.hparams.behavior.n_beams, 12);
        assert_eq!(r.hparams.behavior.cosine_schedule_period_iters, 2);

        assert_eq!(r.overridden.len(), 1);
        assert_eq!(
            r.overridden[0].to_string(),
            "Mismatching n_layers parameter in model checkpoint (1) vs config file (50); \
             using the checkpoint."
        );
    }

    #[test]
    fn test_legacy_field_is_migrated() {
        let mut saved = saved_with(|_| {});
        saved.remove("cosine_schedule_period_iters");
        saved.insert("max_iters".into(), serde_json::json!(5));

        let seen = migrate_legacy(&mut saved);
        assert_eq!(seen, vec!["max_iters".to_string()]);
        assert!(!saved.contains_key("max_iters"));
        assert_eq!(saved["cosine_schedule_period_iters"], serde_json::json!(5));

        let mut saved = saved_with(|_| {});
        saved.remove("cosine_schedule_period_iters");
        saved.insert("max_iters".into(), serde_json::json!(5));
        let mut config = Hyperparameters::default();
        config.behavior.cosine_schedule_period_iters = 5;
        let r = reconcile(Some(&saved), &config).unwrap();
        assert_eq!(r.deprecated, vec!["max_iters".to_string()]);
        assert_eq!(r.hparams.behavior.cosine_schedule_period_iters, 5);
        assert!(r.overridden.is_empty());
    }

    #[test]
    fn test_migrated_value_beats_config_with_notice() {
        let mut saved = saved_with(|_| {});
        saved.remove("cosine_schedule_period_iters");
        saved.insert("max_iters".into(), serde_json::json!(5));

        let config = Hyperparameters::default();
        assert_eq!(config.behavior.cosine_schedule_period_iters, 600_000);
        let r = reconcile(Some(&saved), &config).unwrap();
        assert_eq!(r.hparams.behavior.cosine_schedule_period_iters, 5);
        assert_eq!(r.overridden.len(), 1);
        assert_eq!(r.overridden[0].field, "cosine_schedule_period_iters");
        assert_eq!(r.overridden[0].checkpoint, serde_json::json!(5));
        assert_eq!(r.overridden[0].config, serde_json::json!(600_000));
    }

    #[test]
    fn test_current_name_in_checkpoint_stays_behavioral() {
        // Not migrated: the config still decides.
        let mut saved = saved_with(|hp| hp.behavior.cosine_schedule_period_iters = 7);
        saved.insert("max_iters".into(), serde_json::json!(5));
        let r = reconcile(Some(&saved), &Hyperparameters::default()).unwrap();
        assert_eq!(r.deprecated, vec!["max_iters".to_string()]);
        assert_eq!(r.hparams.behavior.cosine_schedule_period_iters, 600_000);
        assert!(r.overridden.is_empty());
    }

    #[test]
    fn test_current_name_wins_over_legacy() {
        let mut saved = saved_with(|hp| hp.behavior.cosine_schedule_period_iters = 7);
        saved.insert("max_iters".into(), serde_json::json!(5));
        let seen = migrate_legacy(&mut saved);
        assert_eq!(seen.len(), 1);
        assert_eq!(saved["cosine_schedule_period_iters"], serde_json::json!(7));
    }

    #[test]
    fn test_missing_map_uses_config() {
        let config = Hyperparameters::default();
        let r = reconcile(None, &config).unwrap();
        assert_eq!(r.source, HparamSource::ConfigOnly);
        assert_eq!(r.hparams, config);
        assert!(r.overridden.is_empty());
    }

    #[test]
    fn test_partial_map_keeps_config_for_absent_fields() {
        let mut saved = HparamMap::new();
        saved.insert("n_layers".into(), serde_json::json!(2));
        let r = reconcile(Some(&saved), &Hyperparameters::default()).unwrap();
        assert_eq!(r.hparams.architecture.n_layers, 2);
        assert_eq!(r.hparams.architecture.dim_model, 512);
    }
}
