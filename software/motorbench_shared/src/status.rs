//! Driver-to-host telemetry record.
use byte_struct::*;

/// One telemetry reading from one motor.
///
/// A read returns `[Status; N]`, index-aligned with the command batch.
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq)]
#[byte_struct_le]
pub struct Status {
    /// Free-running driver cycle counter, advancing while the link is live.
    /// Wraps at `u32::MAX`.
    pub mcu_timestamp: u32,

    /// `Command::host_timestamp` of the last command the driver accepted.
    /// Zero until the first command arrives.
    pub host_timestamp_received: u32,

    /// Rotor position [rad]
    pub motor_position: f32,

    /// Output-side position [rad]
    pub joint_position: f32,

    /// Quadrature-axis current [A]
    pub iq: f32,

    /// Estimated output torque [Nm]
    pub torque: f32,

    /// Raw encoder count
    pub motor_encoder: i32,

    /// Mode-specific diagnostic value
    pub reserved: f32,
}

impl Status {
    /// Whether this reading was produced after `prev`.
    ///
    /// A zero or non-advancing cycle counter indicates a stalled
    /// or disconnected driver rather than a new measurement. The counter
    /// is compared in serial-number order, so a wrap past `u32::MAX` still
    /// counts as progress as long as fewer than 2^31 cycles went by.
    pub fn is_fresh_since(&self, prev: Option<&Status>) -> bool {
        if self.mcu_timestamp == 0 {
            return false;
        }
        match prev {
            Some(prev) => (self.mcu_timestamp.wrapping_sub(prev.mcu_timestamp) as i32) > 0,
            None => true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packed_layout() {
        assert_eq!(Status::BYTE_LEN, 32);

        let s = Status {
            mcu_timestamp: 3,
            host_timestamp_received: 1,
            iq: 0.25,
            motor_encoder: -12,
            ..Default::default()
        };
        let mut buf = [0_u8; Status::BYTE_LEN];
        s.write_bytes(&mut buf);
        assert_eq!(Status::read_bytes(&buf), s);
    }

    #[test]
    fn freshness() {
        let a = Status {
            mcu_timestamp: 10,
            ..Default::default()
        };
        let b = Status {
            mcu_timestamp: 11,
            ..Default::default()
        };
        assert!(a.is_fresh_since(None));
        assert!(b.is_fresh_since(Some(&a)));
        assert!(!a.is_fresh_since(Some(&a)));
        assert!(!a.is_fresh_since(Some(&b)));
        assert!(!Status::default().is_fresh_since(None));
    }

    #[test]
    fn freshness_across_counter_wrap() {
        let at = |mcu_timestamp| Status {
            mcu_timestamp,
            ..Default::default()
        };
        let last = at(u32::MAX);
        assert!(at(1).is_fresh_since(Some(&last)));
        assert!(at(40).is_fresh_since(Some(&at(u32::MAX - 50))));
        assert!(!last.is_fresh_since(Some(&at(1))));

        // Zero is still a stalled read, even right after the wrap
        assert!(!at(0).is_fresh_since(Some(&last)));

        // More than half the counter range behind reads as going backwards
        assert!(!at(10).is_fresh_since(Some(&at(10 + (1 << 31)))));
        assert!(at(10 + (1 << 31) - 1).is_fresh_since(Some(&at(10))));
    }
}
