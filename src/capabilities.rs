//! Async capability facade over the blocking core.
//!
//! The control core is synchronous: serial exchanges block for at most the
//! configured timeout and `wait_movement` blocks until the stage settles. An
//! async front-end must not run either on its executor threads, so this
//! module exposes the stage as a [`Movable`] capability whose methods hop
//! onto the blocking thread pool via `tokio::task::spawn_blocking`.
//!
//! # Example
//!
//! ```no_run
//! use stage_control::capabilities::{Movable, StageHandle};
//! use stage_control::config::Settings;
//! use stage_control::stage::StageControl;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::new(None)?;
//!     let stage = Arc::new(StageControl::from_settings(&settings.stage));
//!     let handle = StageHandle::new(stage);
//!
//!     handle.home().await?;
//!     handle.move_abs(12.5).await?;
//!     handle.wait_settled().await?;
//!     println!("at {:.3} mm", handle.position().await?);
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::stage::{MovementOutcome, StageControl};

/// Speed used by the facade when the front-end does not configure one.
pub const DEFAULT_SPEED_MM_S: f64 = 3.0;

/// Capability: Motion Control
///
/// Positions are millimeters in the stage's logical coordinates (0 at the
/// reference switch). `move_abs` and `move_rel` initiate motion and return;
/// `wait_settled` blocks until the controller reports a terminal status.
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to an absolute position in millimeters.
    async fn move_abs(&self, position_mm: f64) -> Result<()>;

    /// Move relative to the current position.
    async fn move_rel(&self, distance_mm: f64) -> Result<()>;

    /// Current position in millimeters.
    async fn position(&self) -> Result<f64>;

    /// Wait for the current motion to settle.
    async fn wait_settled(&self) -> Result<()>;

    /// Stop motion immediately.
    ///
    /// Not all devices support this; the default implementation reports
    /// that.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// [`Movable`] handle around a shared [`StageControl`].
pub struct StageHandle {
    /// The shared stage core.
    pub driver: Arc<StageControl>,
    speed_mm_s: f64,
}

impl StageHandle {
    /// Wrap a stage core with the default motion speed.
    pub fn new(driver: Arc<StageControl>) -> Self {
        Self {
            driver,
            speed_mm_s: DEFAULT_SPEED_MM_S,
        }
    }

    /// Use a custom motion speed in mm/s for subsequent moves.
    pub fn with_speed(mut self, speed_mm_s: f64) -> Self {
        self.speed_mm_s = speed_mm_s;
        self
    }

    /// Reference the stage and wait for the seek to finish.
    pub async fn home(&self) -> Result<()> {
        let driver = self.driver.clone();
        let outcome = tokio::task::spawn_blocking(move || driver.do_referencing())
            .await
            .context("stage task panicked")??;
        match outcome {
            MovementOutcome::Completed => Ok(()),
            MovementOutcome::EndedPrematurely => {
                Err(anyhow!("referencing ended prematurely"))
            }
        }
    }
}

#[async_trait]
impl Movable for StageHandle {
    async fn move_abs(&self, position_mm: f64) -> Result<()> {
        let driver = self.driver.clone();
        let speed = self.speed_mm_s;
        tokio::task::spawn_blocking(move || driver.move_absolute_mm(position_mm, speed))
            .await
            .context("stage task panicked")??;
        Ok(())
    }

    async fn move_rel(&self, distance_mm: f64) -> Result<()> {
        let driver = self.driver.clone();
        let speed = self.speed_mm_s;
        tokio::task::spawn_blocking(move || driver.move_relative_mm(distance_mm, speed))
            .await
            .context("stage task panicked")??;
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        let driver = self.driver.clone();
        let position = tokio::task::spawn_blocking(move || driver.get_position_mm())
            .await
            .context("stage task panicked")??;
        Ok(position)
    }

    async fn wait_settled(&self) -> Result<()> {
        let driver = self.driver.clone();
        let outcome = tokio::task::spawn_blocking(move || driver.wait_movement())
            .await
            .context("stage task panicked")??;
        match outcome {
            MovementOutcome::Completed => Ok(()),
            MovementOutcome::EndedPrematurely => Err(anyhow!(
                "movement ended prematurely, the stage must be referenced again"
            )),
        }
    }

    async fn stop(&self) -> Result<()> {
        let driver = self.driver.clone();
        tokio::task::spawn_blocking(move || driver.stop())
            .await
            .context("stage task panicked")??;
        Ok(())
    }
}
