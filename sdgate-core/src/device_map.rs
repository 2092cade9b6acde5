#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Placement {
    ForceCpu,
    Ordinal(usize),
}

impl Default for Placement {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// Where each model component runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceMap {
    pub placement: Placement,
    pub clip_on_cpu: bool,
    pub vae_on_cpu: bool,
    pub control_net_on_cpu: bool,
}

impl DeviceMap {
    pub fn cpu() -> Self {
        Self {
            placement: Placement::ForceCpu,
            ..Self::default()
        }
    }
}
