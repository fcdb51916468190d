//! Channel substrate: durable channels, members, and messages.

pub mod store;

pub use store::{
    Channel, ChannelMember, ChannelMessage, ChannelPreview, ChannelStore, ChannelType,
    ChannelWithMembers, CreateChannelInput, MemberRole, MessageQuery,
};
