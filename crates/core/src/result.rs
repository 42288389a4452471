//! Result type definition.

use crate::error::Error;

/// The standard Result type for ctrl operations.
///
/// # Examples
///
/// ```ignore
/// fn start(manager: &ControllerManager, token: CancellationToken) -> Result<()> {
///     manager.start(token).await?;
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;
