//! Pipeline configuration, loaded from JSON. Every section and key is optional; missing values
//! take their defaults.

use crate::align::{AlignParams, CcaParams};
use crate::cell_cycle::CellCycleParams;
use crate::cluster::ClusterParams;
use crate::markers::MarkerParams;
use crate::normalization::{NormalizeParams, ScaleParams};
use crate::pathway::PathwayParams;
use crate::projection::Tsne;
use crate::qc::QcParams;
use crate::variable_features::VariableFeatureParams;
use anyhow::{Context, Error};
use scalign_types::PipelineError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub qc: QcParams,
    pub normalize: NormalizeParams,
    pub cell_cycle: CellCycleParams,
    pub scale: ScaleParams,
    pub variable_features: VariableFeatureParams,
    pub cca: CcaParams,
    pub align: AlignParams,
    pub cluster: ClusterParams,
    pub tsne: Tsne,
    pub markers: MarkerParams,
    pub pathway: PathwayParams,
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<PipelineConfig, Error> {
        let file = File::open(path).with_context(|| format!("opening config {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| PipelineError::format(path.display().to_string(), e.to_string()))?;
        Ok(config)
    }

    /// Check every section and the constraints between sections.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.qc.validate()?;
        if !(self.normalize.scale_factor > 0.0 && self.normalize.scale_factor.is_finite()) {
            return Err(PipelineError::invalid(format!(
                "scale factor {} must be positive",
                self.normalize.scale_factor
            )));
        }
        if !(self.scale.scale_max > 0.0) {
            return Err(PipelineError::invalid(format!(
                "scale_max {} must be positive",
                self.scale.scale_max
            )));
        }
        self.variable_features.validate()?;
        self.align.validate()?;
        self.cluster.validate()?;
        self.markers.validate()?;

        if self.cca.num_cc < self.align.dims {
            return Err(PipelineError::invalid(format!(
                "{} alignment dimensions but only {} canonical correlates",
                self.align.dims, self.cca.num_cc
            )));
        }
        if self.cluster.dims > self.align.dims {
            return Err(PipelineError::invalid(format!(
                "clustering on {} dimensions but only {} are aligned",
                self.cluster.dims, self.align.dims
            )));
        }
        if !(2..=3).contains(&self.tsne.n_dims) || !(self.tsne.perplexity > 0.0) || !(self.tsne.theta >= 0.0) {
            return Err(PipelineError::invalid(
                "t-SNE needs 2 or 3 dimensions, a positive perplexity and a non-negative theta",
            ));
        }
        if self.cell_cycle.enabled() && (self.cell_cycle.s_genes.is_empty() || self.cell_cycle.g2m_genes.is_empty())
        {
            return Err(PipelineError::invalid("cell-cycle scoring needs both S and G2/M genes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::markers::Correction;
    use crate::variable_features::Selection;
    use std::io::Write;

    fn write_config(text: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        File::create(&path).unwrap().write_all(text.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_defaults_validate() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cluster.k, 30);
        assert_eq!(config.align.var_ratio_threshold, 0.5);
        assert_eq!(config.qc.percent_mito.high, Some(0.08));
    }

    #[test]
    fn test_partial_json() {
        let (_dir, path) = write_config(
            r#"{
                "align": {"dims": 10},
                "cluster": {"dims": 10, "resolution": 0.6},
                "variable_features": {"selection": {"TopN": 1000}},
                "markers": {"correction": "BenjaminiHochberg"}
            }"#,
        );
        let config = PipelineConfig::from_json_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.align.dims, 10);
        assert_eq!(config.cluster.resolution, 0.6);
        assert_eq!(config.cluster.k, 30);
        assert_eq!(config.variable_features.selection, Selection::TopN(1000));
        assert_eq!(config.markers.correction, Correction::BenjaminiHochberg);
        assert_eq!(config.cca.num_cc, 30);
    }

    #[test]
    fn test_bad_config() {
        let (_dir, path) = write_config(r#"{"clustr": {}}"#);
        let err = PipelineConfig::from_json_file(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Format { .. })
        ));

        let config = PipelineConfig {
            cluster: ClusterParams {
                dims: 25,
                ..ClusterParams::default()
            },
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::InvalidParameter(_))));

        let mut config = PipelineConfig::default();
        config.cell_cycle.s_genes = vec!["PCNA".to_string()];
        assert!(config.validate().is_err());
    }
}
