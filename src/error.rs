// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types

use std::fmt;

/// ECS error type
#[derive(Debug, Clone)]
pub enum EcsError {
    /// Stale, destroyed or never-created entity handle
    InvalidEntity,

    /// Component not present on the entity
    MissingComponent,

    /// Shared component not present on the entity
    MissingSharedComponent,

    /// Singleton component not present in the world
    MissingSingleton,

    /// Component already present on the entity
    ComponentAlreadyPresent,

    /// Shared component already present on the entity
    SharedComponentAlreadyPresent,

    /// Singleton component already present in the world
    SingletonAlreadyPresent,

    /// Type registered with conflicting classifications, or used where
    /// its classification forbids it
    TypeContract(String),

    /// A scheduled task panicked; the payload is the panic message
    TaskPanicked(String),

    /// A deferred command failed during the sync drain
    Command {
        /// Recording worker, `None` for the main buffer
        worker: Option<u32>,
        /// Index of the command within its buffer
        index: usize,
        /// The underlying failure
        source: Box<EcsError>,
    },
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::InvalidEntity => write!(f, "Invalid entity handle"),
            EcsError::MissingComponent => write!(f, "Component not present"),
            EcsError::MissingSharedComponent => write!(f, "Shared component not present"),
            EcsError::MissingSingleton => write!(f, "Singleton component not present"),
            EcsError::ComponentAlreadyPresent => write!(f, "Component already present"),
            EcsError::SharedComponentAlreadyPresent => {
                write!(f, "Shared component already present")
            }
            EcsError::SingletonAlreadyPresent => write!(f, "Singleton component already present"),
            EcsError::TypeContract(msg) => write!(f, "Type contract violation: {msg}"),
            EcsError::TaskPanicked(msg) => write!(f, "Task panicked: {msg}"),
            EcsError::Command {
                worker,
                index,
                source,
            } => match worker {
                Some(worker) => {
                    write!(f, "Command {index} from worker {worker} failed: {source}")
                }
                None => write!(f, "Command {index} from the main buffer failed: {source}"),
            },
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
