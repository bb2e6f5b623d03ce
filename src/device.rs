use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
  error::{GraphError, Result},
  graph::Node,
  layer::Engine,
  scalar::Real,
};


/// Compute capability of a [Device].

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
  /// Plain host execution; cannot hold compiled programs.
  Cpu,
  /// Accelerator target addressed by a platform/device pair.
  Accel,
}


/// Handle to a compiled accelerator program.
///
/// The program source itself is a collaborator concern; the engine only
/// needs an opaque handle that proves compilation happened and can be
/// invoked.

#[derive(Debug)]
pub struct Program {
  signature: String,
  id: usize,
  launches: AtomicUsize,
}

impl Program {
  pub fn signature(&self) -> &str {
    &self.signature
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn launches(&self) -> usize {
    self.launches.load(Ordering::Relaxed)
  }

  /// Invoke the compiled program, running `kernel` as its host-side
  /// execution path.

  pub fn launch<R>(&self, kernel: impl FnOnce() -> R) -> R {
    self.launches.fetch_add(1, Ordering::Relaxed);
    log::trace!("launching program {}", self.signature);
    kernel()
  }
}


/// Registry of compiled programs, shared by the devices constructed from
/// it. Cloning shares the underlying cache.
///
/// A given signature is compiled at most once, even when several threads
/// race to register the same operation; later registrations return the
/// cached handle. Tests isolate themselves by constructing a fresh
/// registry instead of resetting global state.

#[derive(Debug, Clone, Default)]
pub struct ProgramRegistry {
  programs: Arc<Mutex<HashMap<String, Arc<Program>>>>,
}

impl ProgramRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, signature: &str) -> Arc<Program> {
    let mut programs = self.programs.lock().unwrap();
    if let Some(program) = programs.get(signature) {
      log::debug!("program cache hit for {}", signature);
      return program.clone();
    }
    log::debug!("compiling program {}", signature);
    let program = Arc::new(Program {
      signature: signature.to_string(),
      id: programs.len(),
      launches: AtomicUsize::new(0),
    });
    programs.insert(signature.to_string(), program.clone());
    program
  }

  pub fn lookup(&self, signature: &str) -> Option<Arc<Program>> {
    self.programs.lock().unwrap().get(signature).cloned()
  }

  pub fn num_programs(&self) -> usize {
    self.programs.lock().unwrap().len()
  }
}


/// A compute target that operations can be registered on.
///
/// Accelerator devices compile-and-cache one program per operation
/// signature through their [ProgramRegistry]; host devices accept no
/// registrations at all.

#[derive(Debug, Clone)]
pub struct Device {
  kind: DeviceKind,
  platform: usize,
  id: usize,
  registry: ProgramRegistry,
}

impl Device {
  pub fn cpu() -> Self {
    Self {
      kind: DeviceKind::Cpu,
      platform: 0,
      id: 0,
      registry: ProgramRegistry::new(),
    }
  }

  pub fn accel(registry: ProgramRegistry, platform: usize, id: usize) -> Self {
    Self { kind: DeviceKind::Accel, platform, id, registry }
  }

  pub fn kind(&self) -> DeviceKind {
    self.kind
  }

  pub fn platform(&self) -> usize {
    self.platform
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn registry(&self) -> &ProgramRegistry {
    &self.registry
  }

  /// Compile-and-cache the node's operation for this device.
  ///
  /// Fails when the device cannot hold programs, when the node's engine
  /// is not the accelerator engine, or when the operation ships no
  /// accelerator program. Re-registering an already compiled operation
  /// leaves the registry unchanged.

  pub fn register_op<T: Real>(&self, node: &Node<T>) -> Result<()> {
    let op = node.op().layer_type();
    if self.kind == DeviceKind::Cpu {
      return Err(GraphError::DeviceWithoutAccel { op: op.to_string() });
    }
    if node.engine() != Engine::Accel {
      return Err(GraphError::EngineRequired {
        op: op.to_string(),
        required: Engine::Accel,
        actual: node.engine(),
      });
    }
    let signature = node.op().kernel_signature()
      .ok_or_else(|| GraphError::UnsupportedEngine {
        op: op.to_string(),
        engine: Engine::Accel,
      })?;
    self.registry.register(&signature);
    Ok(())
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn register_is_idempotent() {
    let registry = ProgramRegistry::new();
    assert_eq!(registry.num_programs(), 0);

    let first = registry.register("conv2d_5x5x1");
    assert_eq!(registry.num_programs(), 1);

    let second = registry.register("conv2d_5x5x1");
    assert_eq!(registry.num_programs(), 1);
    assert_eq!(first.id(), second.id());

    registry.register("conv2d_3x3x4");
    assert_eq!(registry.num_programs(), 2);
  }

  #[test]
  fn registries_are_isolated() {
    let a = ProgramRegistry::new();
    let b = ProgramRegistry::new();
    a.register("conv2d_5x5x1");
    assert_eq!(a.num_programs(), 1);
    assert_eq!(b.num_programs(), 0);
  }

  #[test]
  fn clones_share_the_cache() {
    let registry = ProgramRegistry::new();
    let device = Device::accel(registry.clone(), 2, 0);
    device.registry().register("pool_4x4");
    assert_eq!(registry.num_programs(), 1);
  }

  #[test]
  fn launch_counts() {
    let registry = ProgramRegistry::new();
    let program = registry.register("conv2d_5x5x1");
    let out = program.launch(|| 40 + 2 );
    assert_eq!(out, 42);
    assert_eq!(program.launches(), 1);
  }
}
