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

//! Application entry point: owns the default world and the blocking run loop.

use crate::error::Result;
use crate::system::System;
use crate::world::{World, WorldConfig};

pub struct Instance {
    world: World,
}

impl Instance {
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    pub fn with_config(config: WorldConfig) -> Self {
        Self {
            world: World::with_config(config),
        }
    }

    pub fn register_system(&mut self, system: Box<dyn System>) {
        self.world.register_system(system);
    }

    pub fn world(&mut self) -> &mut World {
        &mut self.world
    }

    /// Run the tick loop on the calling thread until a system quits.
    pub fn start(&mut self) -> Result<()> {
        self.world.run()
    }

    /// Stop after the in-flight tick; callable from any thread.
    pub fn quit(&self) {
        self.world.quit();
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}
