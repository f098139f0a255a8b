//! Traits and helpers for implementing static virtual channels on top of
//! [`rdpcore_core`]'s codec traits.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;

pub use rdpcore_core::{DecodeResult as ChannelResult, Encode};
use rdpcore_core::{EncodeResult, WriteCursor};

/// 8-byte, NUL-padded ASCII channel name as it appears in the Channel Definition
/// Structure (CHANNEL_DEF) of the MCS Connect Initial PDU.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelName([u8; 8]);

impl ChannelName {
    /// Builds a channel name from a compile-time 8-byte literal, e.g. `b"rdpdr\0\0\0"`.
    #[must_use]
    pub const fn from_static(name: &'static [u8; 8]) -> Self {
        Self(*name)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = core::str::from_utf8(&self.0).unwrap_or("<invalid>");
        write!(f, "ChannelName({:?})", s.trim_end_matches('\0'))
    }
}

/// Defines which compression flag should accompany the Channel Definition Structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionCondition {
    /// Virtual channel data will not be compressed.
    Never,
    /// Virtual channel data MUST be compressed if RDP data is being compressed.
    WhenRdpDataIsCompressed,
    /// Virtual channel data MUST be compressed regardless of RDP compression settings.
    Always,
}

/// An outbound message queued by a channel processor, carrying an already-encodable PDU.
pub struct SvcMessage {
    pdu: Box<dyn Encode + Send>,
}

impl SvcMessage {
    #[must_use]
    pub fn size(&self) -> usize {
        self.pdu.size()
    }

    pub fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.pdu.encode(dst)
    }
}

impl fmt::Debug for SvcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SvcMessage({})", self.pdu.name())
    }
}

impl<T> From<T> for SvcMessage
where
    T: Encode + Send + 'static,
{
    fn from(pdu: T) -> Self {
        Self { pdu: Box::new(pdu) }
    }
}

/// A type that is a Static Virtual Channel: created once at session start and driven by
/// complete, reassembled channel frames (chunking across virtual-channel PDUs is handled
/// by the caller, not by implementors of this trait).
pub trait StaticVirtualChannelProcessor: AsAny + fmt::Debug + Send + Sync {
    /// The name this channel is advertised under in the Channel Definition Structure.
    fn channel_name(&self) -> ChannelName;

    /// Defines which compression flag should be sent along the Channel Definition Structure.
    fn compression_condition(&self) -> CompressionCondition {
        CompressionCondition::Never
    }

    /// Processes one complete channel payload and returns any messages to send back.
    fn process(&mut self, payload: &[u8]) -> ChannelResult<Vec<SvcMessage>>;
}

rdpcore_core::assert_obj_safe!(StaticVirtualChannelProcessor);

pub trait AsAny: 'static {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[macro_export]
macro_rules! impl_as_any {
    ($t:ty) => {
        impl $crate::AsAny for $t {
            #[inline]
            fn as_any(&self) -> &dyn core::any::Any {
                self
            }

            #[inline]
            fn as_any_mut(&mut self) -> &mut dyn core::any::Any {
                self
            }
        }
    };
}

/// Registry of active static channels, keyed both by concrete type and by the numeric
/// channel id assigned during MCS channel join.
#[derive(Debug, Default)]
pub struct StaticChannelSet {
    channels: BTreeMap<TypeId, Box<dyn StaticVirtualChannelProcessor>>,
    to_channel_id: BTreeMap<TypeId, u16>,
    to_type_id: BTreeMap<u16, TypeId>,
}

impl StaticChannelSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: StaticVirtualChannelProcessor + 'static>(
        &mut self,
        val: T,
    ) -> Option<Box<dyn StaticVirtualChannelProcessor>> {
        self.channels.insert(TypeId::of::<T>(), Box::new(val))
    }

    pub fn get_by_channel_id_mut(&mut self, channel_id: u16) -> Option<&mut dyn StaticVirtualChannelProcessor> {
        let type_id = *self.to_type_id.get(&channel_id)?;
        self.channels.get_mut(&type_id).map(|boxed| boxed.as_mut())
    }

    pub fn attach_channel_id(&mut self, type_id: TypeId, channel_id: u16) {
        self.to_type_id.insert(channel_id, type_id);
        self.to_channel_id.insert(type_id, channel_id);
    }

    pub fn channel_id_by_type<T: StaticVirtualChannelProcessor + 'static>(&self) -> Option<u16> {
        self.to_channel_id.get(&TypeId::of::<T>()).copied()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut dyn StaticVirtualChannelProcessor> {
        self.channels.values_mut().map(|boxed| boxed.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_debug_trims_padding() {
        let name = ChannelName::from_static(b"rdpdr\0\0\0");
        assert_eq!(format!("{name:?}"), "ChannelName(\"rdpdr\")");
    }
}
