//! Fixture adapters.
//!
//! Each invocation builds one fresh [`Conductor`], hands it to the test
//! body and conducts it afterwards unless the body already did. Test
//! frameworks that run `#[test]` functions in parallel get one independent
//! conductor per test.

use downbeat_core::{Conductor, ConductorConfig, ConductorError, ConfigError};

/// Run `test` against a fresh conductor with the default configuration.
///
/// `test` registers units (and optionally a post-condition); if it does not
/// call [`Conductor::conduct`] itself, it is called once `test` returns.
///
/// # Errors
///
/// Whatever `test` returns, or the error from conducting.
pub fn conducted<F>(test: F) -> Result<(), ConductorError>
where
    F: FnOnce(&Conductor) -> Result<(), ConductorError>,
{
    ConductorFixture::default().run(test)
}

/// Fixture carrying the configuration for the conductors it creates.
#[derive(Debug, Clone, Default)]
pub struct ConductorFixture {
    config: ConductorConfig,
}

impl ConductorFixture {
    /// Create a fixture with the given configuration.
    pub fn new(config: ConductorConfig) -> Self {
        Self { config }
    }

    /// Create a fixture configured from `DOWNBEAT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        ConductorConfig::from_env().map(Self::new)
    }

    /// Configuration used for new conductors.
    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    /// Run `test` against a fresh conductor, conducting it unless `test`
    /// already did.
    ///
    /// # Errors
    ///
    /// - [`ConductorError::Config`] if the configuration is invalid
    /// - whatever `test` returns
    /// - the error from conducting
    pub fn run<F>(&self, test: F) -> Result<(), ConductorError>
    where
        F: FnOnce(&Conductor) -> Result<(), ConductorError>,
    {
        let conductor = Conductor::with_config(self.config.clone())?;
        test(&conductor)?;

        if conductor.has_conduct_begun() {
            tracing::debug!("test body conducted on its own");
            return Ok(());
        }
        conductor.conduct()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use downbeat_core::Misuse;

    use super::*;

    #[test]
    fn conducts_when_body_did_not() {
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&runs);

        conducted(move |c| {
            c.thread("worker", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })?;
            Ok(())
        })
        .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn does_not_conduct_twice() {
        conducted(|c| {
            c.thread("worker", |_| {})?;
            c.conduct()
        })
        .unwrap();
    }

    #[test]
    fn body_error_skips_conduct() {
        let err = conducted(|c| {
            c.thread("worker", |_| {})?;
            c.thread("worker", |_| {})?;
            Ok(())
        })
        .unwrap_err();

        assert!(matches!(err, ConductorError::Misuse(Misuse::DuplicateUnitName(_))));
    }

    #[test]
    fn invalid_config_is_reported() {
        let fixture = ConductorFixture::new(
            ConductorConfig::default().with_poll_period(Duration::ZERO),
        );
        let err = fixture.run(|_| Ok(())).unwrap_err();
        assert!(matches!(err, ConductorError::Config(ConfigError::ZeroPollPeriod)));
    }
}
