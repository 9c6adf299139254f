//! Seeded synthetic event generators for tests and benches.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

use crate::model::{DeviceId, EventRecord};
use crate::temporal::Interval;

/// Shape of a generated population.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub people: usize,
    pub max_devices_per_person: usize,
    pub max_events_per_device: usize,
    pub email_probability: f64,
    pub phone_probability: f64,
    pub external_id_probability: f64,
    pub ad_cookie_probability: f64,
    pub session_probability: f64,
    /// Chance that an event carries another person's email instead of its own.
    pub collision_probability: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            people: 100,
            max_devices_per_person: 3,
            max_events_per_device: 4,
            email_probability: 0.4,
            phone_probability: 0.2,
            external_id_probability: 0.1,
            ad_cookie_probability: 0.0,
            session_probability: 0.0,
            collision_probability: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedDataset {
    pub events: Vec<EventRecord>,
    /// The person each generated device belongs to.
    pub person_of: BTreeMap<DeviceId, usize>,
}

/// Generate events for `config.people` visitors inside `window`.
pub fn generate_events(window: Interval, config: &GeneratorConfig, seed: u64) -> GeneratedDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut events = Vec::new();
    let mut person_of = BTreeMap::new();

    for person in 0..config.people {
        let devices = rng.random_range(1..=config.max_devices_per_person.max(1));
        for device in 0..devices {
            let device_id = format!("dev-{person:05}-{device}");
            person_of.insert(DeviceId::new(device_id.clone()), person);

            let count = rng.random_range(1..=config.max_events_per_device.max(1));
            for n in 0..count {
                let at = rng.random_range(window.start..window.end);
                let mut event = EventRecord::new(format!("{device_id}-e{n}"), device_id.clone(), at);

                if rng.random_bool(config.email_probability) {
                    let owner = if config.people > 1 && rng.random_bool(config.collision_probability) {
                        rng.random_range(0..config.people)
                    } else {
                        person
                    };
                    event = event.with_email(format!("email-{owner:05}"));
                }
                if rng.random_bool(config.phone_probability) {
                    event = event.with_phone(format!("phone-{person:05}"));
                }
                if rng.random_bool(config.external_id_probability) {
                    event = event.with_external_id(format!("crm-{person:05}"));
                }
                if rng.random_bool(config.ad_cookie_probability) {
                    event = event.with_ad_cookie(format!("gclid-{person:05}"));
                }
                if rng.random_bool(config.session_probability) {
                    event = event.with_session(
                        format!("ip-{person:05}"),
                        format!("agent-{}", device % 2),
                        "UTC",
                    );
                }
                events.push(event);
            }
        }
    }

    GeneratedDataset { events, person_of }
}
