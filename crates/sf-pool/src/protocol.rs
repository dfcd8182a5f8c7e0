//! Line-delimited JSON protocol between the pool and worker processes.
//!
//! A spawned worker first reads a [`Setup`] carrying the whole
//! [`FitProblem`]; a forked worker already holds it. Either way the worker
//! announces itself with [`Reply::Ready`] and then answers one [`Request`]
//! per line. Floats cross the wire as raw IEEE-754 bits so that
//! results are bit-identical to in-process evaluation, NaN and infinities
//! included.

use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

use sf_stats::FitProblem;

/// Per-vector evaluation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EvalOutcome {
    Ok {
        #[serde(with = "f64_bits")]
        statistic: f64,
        #[serde(with = "vec_f64_bits")]
        per_bin: Vec<f64>,
    },
    /// The evaluation itself returned an error.
    Failed { message: String },
    /// The worker died on this vector, twice.
    Crashed { message: String },
}

impl EvalOutcome {
    /// The statistic when the evaluation succeeded, finite or not.
    pub fn statistic(&self) -> Option<f64> {
        match self {
            Self::Ok { statistic, .. } => Some(*statistic),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Evaluate `params` against `problem`, folding errors into the outcome.
pub fn evaluate_outcome(problem: &FitProblem, params: &[f64]) -> EvalOutcome {
    match problem.evaluate(params) {
        Ok(out) => EvalOutcome::Ok {
            statistic: out.statistic,
            per_bin: out.per_bin,
        },
        Err(e) => EvalOutcome::Failed {
            message: e.to_string(),
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setup {
    pub worker_id: usize,
    pub problem: FitProblem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Evaluate {
        index: usize,
        #[serde(with = "vec_f64_bits")]
        params: Vec<f64>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Ready { worker_id: usize, pid: u32 },
    Result { index: usize, outcome: EvalOutcome },
}

/// Parent side of one worker's request/reply pipe pair.
pub(crate) struct LineChannel<W, R> {
    writer: Option<W>,
    reader: R,
    line: String,
}

impl<W: Write, R: BufRead> LineChannel<W, R> {
    pub(crate) fn new(writer: W, reader: R) -> Self {
        Self {
            writer: Some(writer),
            reader,
            line: String::new(),
        }
    }

    pub(crate) fn send<T: Serialize>(&mut self, message: &T) -> Result<(), String> {
        let writer = self.writer.as_mut().ok_or("request pipe closed")?;
        let mut json = serde_json::to_string(message).map_err(|e| e.to_string())?;
        json.push('\n');
        writer
            .write_all(json.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| e.to_string())
    }

    pub(crate) fn receive(&mut self) -> Result<Reply, String> {
        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => Err("worker closed stdout".into()),
            Ok(_) => serde_json::from_str(self.line.trim_end())
                .map_err(|e| format!("unreadable reply: {e}")),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Send one vector and wait for the reply carrying the same index.
    pub(crate) fn evaluate(&mut self, index: usize, params: &[f64]) -> Result<EvalOutcome, String> {
        self.send(&Request::Evaluate {
            index,
            params: params.to_vec(),
        })?;
        match self.receive()? {
            Reply::Result {
                index: reply_index,
                outcome,
            } if reply_index == index => Ok(outcome),
            other => Err(format!("unexpected reply {other:?} for vector {index}")),
        }
    }

    /// Drop the request pipe so the worker sees end of input.
    pub(crate) fn close(&mut self) {
        self.writer = None;
    }
}

mod f64_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.to_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(f64::from_bits(u64::deserialize(deserializer)?))
    }
}

mod vec_f64_bits {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        let bits: Vec<u64> = values.iter().map(|v| v.to_bits()).collect();
        bits.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let bits = Vec::<u64>::deserialize(deserializer)?;
        Ok(bits.into_iter().map(f64::from_bits).collect())
    }
}
