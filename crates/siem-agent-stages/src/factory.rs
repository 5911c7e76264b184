// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use siem_agent_core::{AgentIdentity, PipelineFactory, StageError};

use crate::collector::Collector;
use crate::config::AgentConfig;
use crate::monitor::Monitor;
use crate::processor::Processor;
use crate::sender::Sender;

/// Builds the agent's four stages from a loaded [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct AgentPipeline {
    config: AgentConfig,
}

impl AgentPipeline {
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

impl PipelineFactory for AgentPipeline {
    type Collector = Collector;
    type Processor = Processor;
    type Sender = Sender;
    type Monitor = Monitor;

    fn collector(&self) -> Result<Collector, StageError> {
        Ok(Collector::new(self.config.collector.clone())?)
    }

    fn processor(&self) -> Result<Processor, StageError> {
        Ok(Processor::new(&self.config.processor)?)
    }

    fn sender(&self, identity: &AgentIdentity) -> Result<Sender, StageError> {
        Ok(Sender::new(&self.config.sender, identity)?)
    }

    fn monitor(&self, identity: &AgentIdentity) -> Result<Monitor, StageError> {
        Ok(Monitor::new(&self.config.monitor, identity)?)
    }
}
