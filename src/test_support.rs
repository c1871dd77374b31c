use tokio::sync::Mutex as AsyncMutex;

/// Serializes tests that set or clear `TUTOR_*` variables.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());
