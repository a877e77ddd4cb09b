//! Making descriptor writes visible to the hardware table walker.

use crate::table::DescriptorRef;

/// Publishes descriptor writes to hardware table walkers and drops stale translations.
///
/// Every write to a live table is followed by exactly one [`publish`](Coherency::publish)
/// of the written slot; a full pass ends with [`invalidate_all`](Coherency::invalidate_all).
pub trait Coherency {
    /// Orders the preceding write to `slot`, cleans and invalidates its cache line to
    /// the point of coherency, then invalidates every cached translation.
    fn publish(&mut self, slot: DescriptorRef);

    /// Invalidates every cached translation.
    fn invalidate_all(&mut self);
}
