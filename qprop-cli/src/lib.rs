//! Loading and writing the JSON inputs of the `qprop` binary.
use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::{Context as _, Result};
use qprop::{Graph, PropagationConfig, RuleTable};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Propagation flags given on the command line. They win over the config file.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigOverrides {
    /// Storage width handed to fixed output range rules
    #[arg(long, value_parser = clap::value_parser!(u32).range(2..=16))]
    pub bit_width: Option<u32>,

    /// Quantize to unsigned storage
    #[arg(long)]
    pub unsigned: bool,

    /// Quantize every weight per tensor
    #[arg(long)]
    pub disable_per_channel: bool,

    /// Do not infer parameters from weight content or fixed activation ranges
    #[arg(long)]
    pub no_infer_ranges: bool,

    /// Compute scales in single precision
    #[arg(long)]
    pub legacy_float_scale: bool,

    /// The graph already carries calibrated quantize/dequantize pairs
    #[arg(long)]
    pub qdq_conversion: bool,
}

impl ConfigOverrides {
    pub fn apply(&self, mut config: PropagationConfig) -> PropagationConfig {
        if let Some(bit_width) = self.bit_width {
            config.bit_width = bit_width;
        }
        config.signed &= !self.unsigned;
        config.disable_per_channel |= self.disable_per_channel;
        config.infer_ranges &= !self.no_infer_ranges;
        config.legacy_float_scale |= self.legacy_float_scale;
        config.qdq_conversion |= self.qdq_conversion;
        config
    }
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let file =
        File::open(path).with_context(|| format!("opening {what} file {}", path.display()))?;
    let value = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {what} file {}", path.display()))?;
    debug!(path = %path.display(), what, "loaded");
    Ok(value)
}

/// Reads and validates a graph.
pub fn load_graph(path: &Path) -> Result<Graph> {
    read_json(path, "graph")
}

pub fn load_rules(path: &Path) -> Result<RuleTable> {
    read_json(path, "rules")
}

/// The config file when given, the defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<PropagationConfig> {
    match path {
        Some(path) => read_json(path, "config"),
        None => Ok(PropagationConfig::default()),
    }
}

/// Writes `graph` as pretty JSON to `path`, or to stdout.
pub fn write_graph(graph: &Graph, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating output file {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, graph).context("serializing graph")?;
            writer.flush().context("writing graph")?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, graph).context("serializing graph")?;
            writeln!(stdout).context("writing graph")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::fs;

    use qprop::{
        apply_quantization_params_propagation,
        testing::{add_graph, default_rules, int8},
        MinMaxQuantizer,
    };

    use super::*;

    #[test]
    fn test_graph_survives_a_file_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("graph.json");
        let (mut graph, _) = add_graph(&int8(0.5, 0));
        apply_quantization_params_propagation(
            &mut graph,
            &PropagationConfig::default(),
            &default_rules(),
            &MinMaxQuantizer,
        )?;
        write_graph(&graph, Some(&path))?;

        let loaded = load_graph(&path)?;
        assert_eq!(loaded.num_ops(), graph.num_ops());
        assert_eq!(
            serde_json::to_value(&loaded)?,
            serde_json::to_value(&graph)?
        );
        Ok(())
    }

    #[test]
    fn test_load_rules_and_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let rules = dir.path().join("rules.json");
        fs::write(
            &rules,
            r#"{"reshape": {"same_scale": true}, "argmax": {"quantizable": false}}"#,
        )?;
        assert_eq!(load_rules(&rules)?.len(), 2);

        let config = dir.path().join("config.json");
        fs::write(&config, r#"{"disable_per_channel": true}"#)?;
        let loaded = load_config(Some(&config))?;
        assert!(loaded.disable_per_channel);
        assert!(loaded.signed);
        assert_eq!(load_config(None)?, PropagationConfig::default());
        Ok(())
    }

    #[test]
    fn test_config_bit_width_out_of_range() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = dir.path().join("config.json");
        fs::write(&config, r#"{"bit_width": 0}"#)?;
        let err = load_config(Some(&config)).expect_err("zero bit width");
        assert!(err.to_string().contains("parsing config file"));
        assert!(format!("{err:#}").contains("bit_width 0 is outside 2..=16"));
        Ok(())
    }

    #[test]
    fn test_errors_name_the_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("missing.json");
        let err = load_graph(&missing).expect_err("missing file");
        assert!(err.to_string().contains("missing.json"));

        // reads an operand of an operation that comes later
        let broken = dir.path().join("broken.json");
        fs::write(
            &broken,
            r#"{"ops": [{"kind": "return", "operands": [{"op": 1}]}, {"kind": "compute", "name": "relu"}]}"#,
        )?;
        let err = load_graph(&broken).expect_err("unresolved operand");
        assert!(err.to_string().contains("parsing graph file"));
        assert!(format!("{err:#}").contains("not defined before it"));
        Ok(())
    }

    #[test]
    fn test_overrides_win_over_config() {
        let base = PropagationConfig::default().with_legacy_float_scale(true);
        let overrides = ConfigOverrides {
            bit_width: Some(16),
            unsigned: true,
            no_infer_ranges: true,
            ..Default::default()
        };
        let config = overrides.apply(base);
        assert_eq!(config.bit_width, 16);
        assert!(!config.signed);
        assert!(!config.infer_ranges);
        assert!(config.legacy_float_scale);
        assert!(!config.disable_per_channel);

        assert_eq!(
            ConfigOverrides::default().apply(PropagationConfig::default()),
            PropagationConfig::default()
        );
    }
}
