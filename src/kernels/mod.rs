//! Per-operation compute kernels, one module per operation, each with
//! implementations for the engines it supports. Layers dispatch into
//! these by [Engine](crate::Engine) tag.

use serde::{Serialize, Deserialize};

use crate::error::{GraphError, Result};

pub mod fully_connected;
pub mod conv2d;
pub mod max_pooling;


/// Channel connectivity between output and input feature maps.
///
/// The default table connects every pair; a sparse table contributes
/// nothing for pairs marked unconnected, as in the classic LeNet
/// connection scheme.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTable {
  rows: usize,
  cols: usize,
  connected: Option<Vec<bool>>,
}

impl Default for ConnectionTable {
  fn default() -> Self {
    Self::full()
  }
}

impl ConnectionTable {
  /// Fully connected: every (out-channel, in-channel) pair contributes.

  pub fn full() -> Self {
    Self { rows: 0, cols: 0, connected: None }
  }

  /// Sparse table over `rows` output and `cols` input channels.

  pub fn new(rows: usize, cols: usize, pairs: &[(usize, usize)]) -> Result<Self> {
    let mut connected = vec![false; rows * cols];
    for &(o, i) in pairs {
      if o >= rows {
        return Err(GraphError::AllocationInvariant {
          layer: "connection-table".to_string(),
          index: o,
          len: rows,
        });
      }
      if i >= cols {
        return Err(GraphError::AllocationInvariant {
          layer: "connection-table".to_string(),
          index: i,
          len: cols,
        });
      }
      connected[o * cols + i] = true;
    }
    Ok(Self { rows, cols, connected: Some(connected) })
  }

  pub fn is_connected(&self, o: usize, i: usize) -> bool {
    match &self.connected {
      None => true,
      Some(connected) => connected[o * self.cols + i],
    }
  }

  pub fn is_full(&self) -> bool {
    self.connected.is_none()
  }
}
