//! The audio daemon's shared property set.

use propsync_core::{Declarations, Property, PropertyFlags, PropertyValue, Role};

/// Implements [`PropertyValue`] for a fieldless `u8` enum. Bytes outside the
/// listed discriminants do not decode.
macro_rules! enum_value {
    ($name:ident { $($variant:ident = $tag:literal),* $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        #[repr(u8)]
        pub enum $name {
            #[default]
            $($variant = $tag),*
        }

        impl PropertyValue for $name {
            const WIRE_SIZE: usize = 1;

            fn encode(&self, out: &mut [u8]) {
                out[0] = *self as u8;
            }

            fn decode(bytes: &[u8]) -> Option<Self> {
                match bytes {
                    $([$tag] => Some($name::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

enum_value!(PhoneStatus {
    Disconnected = 0,
    Dialing = 1,
    Incoming = 2,
    Connected = 3,
});

enum_value!(HeadsetState {
    None = 0,
    Headset = 1,
    HeadsetMic = 2,
    UsbMicConnected = 3,
    UsbMicDisconnected = 4,
    UsbHeadsetConnected = 5,
    UsbHeadsetDisconnected = 6,
});

enum_value!(MediaServerCommand {
    Null = 0,
    PauseAllMedia = 1,
    PauseAllMediaSaved = 2,
    ResumeAllMediaSaved = 3,
});

enum_value!(AudiodCommand {
    Null = 0,
    UnmuteMedia = 1,
});

/// Properties shared by the audio daemon and its clients. Declaration order
/// fixes the ids, so master and slaves must agree on it.
pub struct AudiodProperties<R: Role> {
    pub phone_status: Property<PhoneStatus, R>,
    pub headset_state: Property<HeadsetState, R>,
    pub ringer_on: Property<bool, R>,
    pub touch_on: Property<bool, R>,
    pub alarm_on: Property<bool, R>,
    pub timer_on: Property<bool, R>,
    pub balance_volume: Property<bool, R>,
    pub ringtone_with_vibration: Property<bool, R>,
    pub phone_locked: Property<bool, R>,
    pub display_on: Property<bool, R>,
    pub recording_audio: Property<bool, R>,
    pub pausing_media_for_phone_call: Property<bool, R>,
    /// One-shot request to the media server; every write is delivered.
    pub media_server_cmd: Property<MediaServerCommand, R>,
    pub audiod_cmd: Property<AudiodCommand, R>,
}

impl<R: Role> AudiodProperties<R> {
    pub fn declare(d: &mut Declarations<R>) -> Self {
        let command = PropertyFlags::SUPPRESS_INITIAL_NOTIFY_ON_CONNECT;
        Self {
            phone_status: d.declare(PhoneStatus::Disconnected),
            headset_state: d.declare(HeadsetState::None),
            ringer_on: d.declare(true),
            touch_on: d.declare(false),
            alarm_on: d.declare(true),
            timer_on: d.declare(true),
            balance_volume: d.declare(false),
            ringtone_with_vibration: d.declare(true),
            phone_locked: d.declare(false),
            display_on: d.declare(false),
            recording_audio: d.declare(false),
            pausing_media_for_phone_call: d.declare(false),
            media_server_cmd: d.declare_with_flags(
                MediaServerCommand::Null,
                command | PropertyFlags::NOTIFY_EVEN_IF_UNCHANGED,
            ),
            audiod_cmd: d.declare_with_flags(AudiodCommand::Null, command),
        }
    }

    /// Logs every change and message on the set.
    pub fn trace(&self) -> Vec<propsync_core::Subscription> {
        let set = self;
        let mut subscriptions = Vec::new();
        macro_rules! watch {
            ($($field:ident),*) => {
                $(
                    subscriptions.push(set.$field.send_changes(|value| {
                        tracing::info!("{} = {:?}", stringify!($field), value);
                    }));
                    subscriptions.push(set.$field.send_messages(|text| {
                        tracing::info!("{}: message {:?}", stringify!($field), text);
                    }));
                )*
            };
        }
        watch!(
            phone_status,
            headset_state,
            ringer_on,
            touch_on,
            alarm_on,
            timer_on,
            balance_volume,
            ringtone_with_vibration,
            phone_locked,
            display_on,
            recording_audio,
            pausing_media_for_phone_call,
            media_server_cmd,
            audiod_cmd
        );
        subscriptions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_values_reject_unknown_tags() {
        assert_eq!(PhoneStatus::decode(&[3]), Some(PhoneStatus::Connected));
        assert_eq!(PhoneStatus::decode(&[4]), None);
        assert_eq!(HeadsetState::decode(&[6]), Some(HeadsetState::UsbHeadsetDisconnected));
        assert_eq!(HeadsetState::decode(&[7]), None);
        assert_eq!(AudiodCommand::decode(&[1, 0]), None);
        assert_eq!(MediaServerCommand::default(), MediaServerCommand::Null);
    }

    #[test]
    fn test_enum_values_fit_a_slot() {
        let slot = MediaServerCommand::PauseAllMediaSaved.to_slot().unwrap();
        assert_eq!(
            MediaServerCommand::from_slot(slot),
            Some(MediaServerCommand::PauseAllMediaSaved)
        );
        assert!(PhoneStatus::op_add(&PhoneStatus::Dialing, &PhoneStatus::Dialing).is_none());
    }
}
