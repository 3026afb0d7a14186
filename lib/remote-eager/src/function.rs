// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Compiled functions.
//!
//! A [`FunctionDef`] is the traced form of a multi-device function: an ordered
//! list of components, each running one op on one device and consuming either
//! the invocation argument or the output of an earlier component. Tracing
//! happens once, in [`FunctionLibrary::register`]; membership changes never
//! re-trace, they only cause the definition to be registered again with
//! whichever endpoints serve the component devices.

use dashmap::DashMap;
use remote_eager_common::LogicalDevice;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::RemoteError;

/// Identity of a traced function within one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(u64);

impl FunctionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Where a component takes its input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentInput {
    /// The argument the function was invoked with.
    Argument,
    /// The output of the component at this (earlier) index.
    Output(usize),
}

/// One device-local portion of a compiled function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDef {
    /// Device to run on. `None` means the device the function is invoked on.
    pub device: Option<LogicalDevice>,
    /// Op name, resolved by the worker's op registry.
    pub op: String,
    pub input: ComponentInput,
}

impl ComponentDef {
    /// Component on the invocation device reading the function argument.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            device: None,
            op: op.into(),
            input: ComponentInput::Argument,
        }
    }

    pub fn on(mut self, device: LogicalDevice) -> Self {
        self.device = Some(device);
        self
    }

    pub fn after(mut self, component: usize) -> Self {
        self.input = ComponentInput::Output(component);
        self
    }
}

/// A traced function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub id: FunctionId,
    pub name: String,
    pub components: Vec<ComponentDef>,
}

impl FunctionDef {
    /// Group component indices into waves: every component in a wave depends
    /// only on components of earlier waves, so a wave can run concurrently.
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let mut levels: Vec<usize> = Vec::with_capacity(self.components.len());
        for component in &self.components {
            let level = match component.input {
                ComponentInput::Argument => 0,
                ComponentInput::Output(dep) => levels.get(dep).map_or(0, |l| l + 1),
            };
            levels.push(level);
        }

        let depth = levels.iter().max().map_or(0, |l| l + 1);
        let mut waves = vec![Vec::new(); depth];
        for (index, level) in levels.into_iter().enumerate() {
            waves[level].push(index);
        }
        waves
    }

    /// The device a component runs on when invoked on `invocation`.
    pub fn component_device<'a>(
        &'a self,
        component: usize,
        invocation: &'a LogicalDevice,
    ) -> Option<&'a LogicalDevice> {
        self.components
            .get(component)
            .map(|c| c.device.as_ref().unwrap_or(invocation))
    }

    fn validate(&self) -> Result<(), RemoteError> {
        if self.components.is_empty() {
            return Err(RemoteError::invalid_function(&self.name, "no components"));
        }
        for (index, component) in self.components.iter().enumerate() {
            if component.op.is_empty() {
                return Err(RemoteError::invalid_function(
                    &self.name,
                    format!("component {index} has an empty op name"),
                ));
            }
            match component.input {
                ComponentInput::Output(dep) if dep >= index => {
                    return Err(RemoteError::invalid_function(
                        &self.name,
                        format!("component {index} reads output {dep}, which is not an earlier component"),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Traced functions known to one execution context.
#[derive(Debug, Default)]
pub struct FunctionLibrary {
    next_id: AtomicU64,
    functions: DashMap<FunctionId, Arc<FunctionDef>>,
    traces: AtomicU64,
}

impl FunctionLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trace a function into the library and return its definition.
    pub fn register(
        &self,
        name: impl Into<String>,
        components: Vec<ComponentDef>,
    ) -> Result<Arc<FunctionDef>, RemoteError> {
        let def = FunctionDef {
            id: FunctionId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            components,
        };
        def.validate()?;

        let def = Arc::new(def);
        self.functions.insert(def.id, def.clone());
        self.traces.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(function = %def.id, name = %def.name, components = def.components.len(), "traced function");
        Ok(def)
    }

    pub fn get(&self, id: FunctionId) -> Result<Arc<FunctionDef>, RemoteError> {
        self.functions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RemoteError::UnknownFunction {
                function: id.to_string(),
            })
    }

    /// Number of times any function has been traced.
    pub fn trace_count(&self) -> u64 {
        self.traces.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(task: u32) -> LogicalDevice {
        LogicalDevice::parse(&format!("/job:worker/replica:0/task:{task}/device:CPU:0")).unwrap()
    }

    #[test]
    fn test_register_assigns_ids_and_counts_traces() {
        let library = FunctionLibrary::new();
        let a = library.register("a", vec![ComponentDef::new("identity")]).unwrap();
        let b = library.register("b", vec![ComponentDef::new("identity")]).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(library.trace_count(), 2);
        assert_eq!(library.len(), 2);
        assert_eq!(library.get(a.id).unwrap().name, "a");
    }

    #[test]
    fn test_unknown_function() {
        let library = FunctionLibrary::new();
        let err = library.get(FunctionId(7)).unwrap_err();
        assert!(matches!(err, RemoteError::UnknownFunction { .. }));
    }

    #[test]
    fn test_rejects_invalid_definitions() {
        let library = FunctionLibrary::new();
        assert!(matches!(
            library.register("empty", vec![]),
            Err(RemoteError::InvalidFunction { .. })
        ));
        assert!(matches!(
            library.register("forward", vec![ComponentDef::new("x").after(0)]),
            Err(RemoteError::InvalidFunction { .. })
        ));
        assert!(matches!(
            library.register("blank", vec![ComponentDef::new("")]),
            Err(RemoteError::InvalidFunction { .. })
        ));
        assert_eq!(library.trace_count(), 0);
    }

    #[test]
    fn test_waves() {
        let def = FunctionDef {
            id: FunctionId(0),
            name: "fanout".into(),
            components: vec![
                ComponentDef::new("a").on(device(1)),
                ComponentDef::new("b").on(device(2)),
                ComponentDef::new("c").after(0),
                ComponentDef::new("d").after(2),
                ComponentDef::new("e").after(1),
            ],
        };
        assert_eq!(def.waves(), vec![vec![0, 1], vec![2, 4], vec![3]]);
    }

    #[test]
    fn test_component_device_defaults_to_invocation() {
        let def = FunctionDef {
            id: FunctionId(0),
            name: "f".into(),
            components: vec![ComponentDef::new("a"), ComponentDef::new("b").on(device(2))],
        };
        let invocation = device(1);
        assert_eq!(def.component_device(0, &invocation), Some(&invocation));
        assert_eq!(def.component_device(1, &invocation), Some(&device(2)));
        assert_eq!(def.component_device(2, &invocation), None);
    }
}
