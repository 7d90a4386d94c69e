//! IdGenerator port - ID 生成の抽象化
//!
//! document の ID は小文字の ULID なので、link は作成順に並びます。

use ulid::Ulid;

use super::clock::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_id(&self) -> String;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_id(&self) -> String {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
            .to_string()
            .to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::clock::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generated_ids_are_unique() {
        let id_gen = UlidGenerator::new(SystemClock);
        let a = id_gen.generate_id();
        let b = id_gen.generate_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 26);
        assert_eq!(a, a.to_lowercase());
    }

    #[test]
    fn fixed_clock_pins_the_timestamp_part() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(at));
        let a = Ulid::from_string(&id_gen.generate_id()).unwrap();
        let b = Ulid::from_string(&id_gen.generate_id()).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.timestamp_ms(), at.timestamp_millis() as u64);
        assert_eq!(a.timestamp_ms(), b.timestamp_ms());
    }
}
