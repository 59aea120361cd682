// Copyright 2025 vmssh contributors
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

//! Per-VM route decisions and batch resolution.
//!
//! [`RouteDetector`] makes the read-only direct-vs-bastion decision for one
//! VM; [`RoutingResolver`] runs detection and tunnel checkout across a
//! batch with bounded parallelism, producing one independent outcome per
//! input VM.

pub mod detector;
pub mod resolver;

pub use detector::{
    DisambiguationPolicy, JumpHostPrompt, RouteDecision, RouteDetector, TerminalPrompt,
};
pub use resolver::{
    ResolveOptions, ResolvedRoute, RouteOutcome, RouteResult, RouteVia, RoutingResolver,
};
