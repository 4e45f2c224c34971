// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Logging setup
//!
//! Thin wrappers over `env_logger`. Engine and transport messages carry
//! the rank, so one process-wide logger serves every rank of a loopback
//! world; repeated initialization is a no-op rather than an error, since
//! in-process worlds have no single natural place to call it from.

/// Initialize logging from the `RUST_LOG` environment.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env().try_init();
}

/// Initialize logging at a fixed level, still overridable per module
/// through `RUST_LOG`.
pub fn init_logging_with_level(level: log::LevelFilter) {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}
