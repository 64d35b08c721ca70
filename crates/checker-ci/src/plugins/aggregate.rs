//! `aggregate`: fold several scores into one percentage.

use async_trait::async_trait;
use serde::Deserialize;

use crate::plugin::{Invocation, Plugin, PluginError, PluginOutput, PluginResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Mean,
    Sum,
    Min,
    Max,
    Product,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::Mean => "mean",
            Strategy::Sum => "sum",
            Strategy::Min => "min",
            Strategy::Max => "max",
            Strategy::Product => "product",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateArgs {
    pub scores: Vec<f64>,
    #[serde(default)]
    pub weights: Option<Vec<f64>>,
    #[serde(default)]
    pub strategy: Strategy,
}

pub struct AggregatePlugin;

impl AggregatePlugin {
    pub fn aggregate(args: &AggregateArgs) -> PluginResult<f64> {
        let weights = args
            .weights
            .clone()
            .unwrap_or_else(|| vec![1.0; args.scores.len()]);
        if weights.len() != args.scores.len() {
            let msg = format!(
                "Length of scores ({}) and weights ({}) does not match",
                args.scores.len(),
                weights.len()
            );
            return Err(PluginError::failed(msg.clone(), msg));
        }
        if args.scores.is_empty() {
            let msg = "No scores to aggregate".to_string();
            return Err(PluginError::failed(msg.clone(), msg));
        }

        let weighted: Vec<f64> = args.scores.iter().zip(&weights).map(|(s, w)| s * w).collect();
        let score = match args.strategy {
            Strategy::Mean => weighted.iter().sum::<f64>() / weighted.len() as f64,
            Strategy::Sum => weighted.iter().sum(),
            Strategy::Min => weighted.iter().copied().fold(f64::INFINITY, f64::min),
            Strategy::Max => weighted.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Strategy::Product => weighted.iter().product(),
        };
        Ok(score)
    }
}

#[async_trait]
impl Plugin for AggregatePlugin {
    const NAME: &'static str = "aggregate";
    type Args = AggregateArgs;

    async fn run(&self, args: AggregateArgs, _invocation: &Invocation) -> PluginResult<PluginOutput> {
        let score = Self::aggregate(&args)?;
        let output = format!(
            "Get scores:  {:?}\nGet weights: {:?}\nAggregate with strategy {}\nScore: {score:.2}",
            args.scores, args.weights, args.strategy
        );
        Ok(PluginOutput::new(output).with_percentage(score))
    }
}
