//! The opaque update record contract.

/// An opaque update record pulled from the remote service.
///
/// The engine relies on exactly one piece of structure: the strictly
/// monotonically increasing `update_id` assigned by the remote protocol.
/// Everything else is payload for the user handler. Updates are held from
/// arrival in a batch until handler resolution, failure, or timeout.
pub trait Update: Clone + Send + 'static {
    /// Protocol-assigned identifier, strictly monotonic across updates.
    fn update_id(&self) -> u64;
}
