// tracefork - Transaction Replay and Path Forensics
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Test utilities for integration tests

/// Logging and warning capture utilities for tests
pub mod logging {
    use parking_lot::Mutex;
    use std::sync::{Arc, OnceLock};
    use tracing::Level;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    /// A tracing layer that keeps WARN and ERROR messages
    #[derive(Clone, Default)]
    pub struct WarningCapture {
        messages: Arc<Mutex<Vec<String>>>,
    }

    impl WarningCapture {
        /// Captured messages, oldest first
        pub fn messages(&self) -> Vec<String> {
            self.messages.lock().clone()
        }

        /// Whether any captured message contains `fragment`
        pub fn contains(&self, fragment: &str) -> bool {
            self.messages.lock().iter().any(|message| message.contains(fragment))
        }

        /// Forget everything captured so far
        pub fn clear(&self) {
            self.messages.lock().clear();
        }
    }

    impl<S> tracing_subscriber::Layer<S> for WarningCapture
    where
        S: tracing::Subscriber,
    {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() > Level::WARN {
                return;
            }

            struct MessageVisitor {
                message: String,
            }

            impl tracing::field::Visit for MessageVisitor {
                fn record_debug(
                    &mut self,
                    field: &tracing::field::Field,
                    value: &dyn std::fmt::Debug,
                ) {
                    if field.name() == "message" {
                        self.message = format!("{value:?}");
                    }
                }

                fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                    if field.name() == "message" {
                        self.message = value.to_string();
                    }
                }
            }

            let mut visitor = MessageVisitor { message: String::new() };
            event.record(&mut visitor);
            if !visitor.message.is_empty() {
                self.messages.lock().push(visitor.message);
            }
        }
    }

    static CAPTURE: OnceLock<WarningCapture> = OnceLock::new();

    /// Install test logging with warning capture, once per test binary
    ///
    /// Every call returns the same capture; tests reading it should run
    /// serially and clear it first.
    pub fn warning_capture() -> WarningCapture {
        CAPTURE
            .get_or_init(|| {
                let capture = WarningCapture::default();
                let _ = tracing_subscriber::registry()
                    .with(capture.clone())
                    .with(tracing_subscriber::fmt::layer().with_test_writer())
                    .with(
                        tracing_subscriber::EnvFilter::try_from_default_env()
                            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                    )
                    .try_init();
                capture
            })
            .clone()
    }
}

/// Initialization utilities for tests
pub mod init {
    /// Initialize logging for a test
    pub fn init_test_environment() {
        super::logging::warning_capture();
    }
}
