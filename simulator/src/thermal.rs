use rand::Rng;

pub const MIN_TEMP: f64 = 5.0;
pub const MAX_TEMP: f64 = 35.0;

/// First-order room model driven by the controller's heating command.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedValve {
    pub heating: bool,
    pub temperature: f64,
}

impl SimulatedValve {
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            heating: false,
            temperature: round2(rng.gen_range(18.0..22.0)),
        }
    }

    pub fn step<R: Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        let delta = if self.heating {
            rng.gen_range(0.05..0.25)
        } else {
            -rng.gen_range(0.01..0.15)
        };
        self.temperature = round2((self.temperature + delta).clamp(MIN_TEMP, MAX_TEMP));
        self.temperature
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
