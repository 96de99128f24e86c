//! Core simulation types for the pandemos workspace.
//!
//! The world advances in frame-sized steps: every [`World::step`] call moves
//! persons, resolves infection events, and reports aggregate changes. All
//! proximity interactions within a step are evaluated against the positions
//! persons held when the step began, so outcomes never depend on iteration
//! order.

use glam::Vec2;
use ordered_float::OrderedFloat;
use pandemos_index::{ProximityIndex, UniformGridIndex};
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tracing::debug;

pub use glam;
pub use pandemos_index::IndexError;

new_key_type! {
    /// Stable handle for persons backed by a generational slot map.
    pub struct PersonKey;
    /// Stable handle for regions.
    pub struct RegionId;
    /// Stable handle for communities.
    pub struct CommunityId;
}

/// Convenience alias for associating side data with persons.
pub type PersonMap<T> = SecondaryMap<PersonKey, T>;

/// 8-bit RGB color triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    /// Build a color from its channels.
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Infection states a person can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthState {
    Susceptible,
    Infected,
    Recovered,
    Deceased,
}

impl HealthState {
    /// Display color associated with the state.
    #[must_use]
    pub const fn color(self) -> Rgb {
        match self {
            Self::Susceptible => Rgb::new(255, 255, 255),
            Self::Infected => Rgb::new(255, 0, 0),
            Self::Recovered => Rgb::new(100, 255, 100),
            Self::Deceased => Rgb::new(100, 100, 100),
        }
    }
}

/// Axis-aligned rectangle described by its center and size.
///
/// Coordinates follow the screen convention: `y` grows downward, so
/// [`Rect::top`] is the smallest `y` and [`Rect::bottom`] the largest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    /// Center point.
    pub center: Vec2,
    /// Full width and height.
    pub size: Vec2,
}

impl Rect {
    /// Build a rectangle from its center and size.
    #[must_use]
    pub const fn new(center: Vec2, size: Vec2) -> Self {
        Self { center, size }
    }

    /// Smallest `x` edge.
    #[must_use]
    pub fn left(&self) -> f32 {
        self.center.x - self.size.x * 0.5
    }

    /// Largest `x` edge.
    #[must_use]
    pub fn right(&self) -> f32 {
        self.center.x + self.size.x * 0.5
    }

    /// Smallest `y` edge.
    #[must_use]
    pub fn top(&self) -> f32 {
        self.center.y - self.size.y * 0.5
    }

    /// Largest `y` edge.
    #[must_use]
    pub fn bottom(&self) -> f32 {
        self.center.y + self.size.y * 0.5
    }

    /// Corner with the smallest coordinates.
    #[must_use]
    pub fn min_corner(&self) -> Vec2 {
        self.center - self.size * 0.5
    }

    /// Corner with the largest coordinates.
    #[must_use]
    pub fn max_corner(&self) -> Vec2 {
        self.center + self.size * 0.5
    }

    /// Whether `point` lies inside the rectangle, edges inclusive.
    #[must_use]
    pub fn contains(&self, point: Vec2) -> bool {
        let min = self.min_corner();
        let max = self.max_corner();
        point.x >= min.x && point.x <= max.x && point.y >= min.y && point.y <= max.y
    }

    /// The rectangle shrunk by `amount` on every side.
    #[must_use]
    pub fn inset(&self, amount: f32) -> Self {
        Self {
            center: self.center,
            size: self.size - Vec2::splat(amount * 2.0),
        }
    }

    /// Clamp `point` into the rectangle shrunk by `margin` on every side.
    #[must_use]
    pub fn clamp_point(&self, point: Vec2, margin: f32) -> Vec2 {
        let min = self.min_corner() + Vec2::splat(margin);
        let max = self.max_corner() - Vec2::splat(margin);
        Vec2::new(
            point.x.max(min.x).min(max.x),
            point.y.max(min.y).min(max.y),
        )
    }
}

/// Color gradient blending between ordered stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gradient {
    stops: Vec<(f32, Rgb)>,
}

impl Gradient {
    /// Build a gradient; stops are sorted by position and duplicates dropped.
    #[must_use]
    pub fn new(stops: impl IntoIterator<Item = (f32, Rgb)>) -> Self {
        let mut stops: Vec<(f32, Rgb)> = stops.into_iter().collect();
        stops.sort_by(|a, b| a.0.total_cmp(&b.0));
        stops.dedup_by(|a, b| a.0 == b.0);
        Self { stops }
    }

    /// Interpolated color at `value`, clamped to the stop domain.
    #[must_use]
    pub fn color_at(&self, value: f32) -> Rgb {
        let (first, last) = match (self.stops.first(), self.stops.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Rgb::new(0, 0, 0),
        };
        if value <= first.0 {
            return first.1;
        }
        if value >= last.0 {
            return last.1;
        }
        let Some(pair) = self
            .stops
            .windows(2)
            .find(|pair| value >= pair[0].0 && value <= pair[1].0)
        else {
            return last.1;
        };
        let (lower, upper) = (pair[0], pair[1]);
        let t = (value - lower.0) / (upper.0 - lower.0);
        Rgb::new(
            lerp_channel(lower.1.r, upper.1.r, t),
            lerp_channel(lower.1.g, upper.1.g, t),
            lerp_channel(lower.1.b, upper.1.b, t),
        )
    }
}

impl Default for Gradient {
    /// Green-to-red ramp used for proximity overlays.
    fn default() -> Self {
        Self::new([
            (0.0, Rgb::new(0, 255, 0)),
            (100.0, Rgb::new(255, 255, 0)),
            (200.0, Rgb::new(255, 0, 0)),
            (255.0, Rgb::new(255, 0, 0)),
        ])
    }
}

fn lerp_channel(lower: u8, upper: u8, t: f32) -> u8 {
    (f32::from(lower) + (f32::from(upper) - f32::from(lower)) * t) as u8
}

/// Overlay intensity for a neighbor at `distance`, fading linearly from 255
/// at zero distance to 0 at `radius`.
#[must_use]
pub fn proximity_intensity(distance: f32, radius: f32) -> f32 {
    if radius <= 0.0 {
        return 0.0;
    }
    255.0 * (1.0 - distance.min(radius) / radius)
}

/// Rectangular bounding region with an inset border.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    label: String,
    outer: Rect,
    border: f32,
}

impl Region {
    /// Create a region from its outer rectangle and border thickness.
    #[must_use]
    pub fn new(label: impl Into<String>, outer: Rect, border: f32) -> Self {
        Self {
            label: label.into(),
            outer,
            border,
        }
    }

    /// Label shown in diagnostics.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Outer rectangle, border included.
    #[must_use]
    pub const fn outer(&self) -> Rect {
        self.outer
    }

    /// Interior rectangle persons are confined to.
    #[must_use]
    pub fn interior(&self) -> Rect {
        self.outer.inset(self.border)
    }
}

/// Region that encapsulates part of the population and exchanges it with
/// others through a travel hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    region: Region,
    active: bool,
    hub_size: f32,
}

impl Community {
    /// Create an active community.
    #[must_use]
    pub fn new(label: impl Into<String>, outer: Rect, border: f32, hub_size: f32) -> Self {
        Self {
            region: Region::new(label, outer, border),
            active: true,
            hub_size,
        }
    }

    /// Label shown in diagnostics.
    #[must_use]
    pub fn label(&self) -> &str {
        self.region.label()
    }

    /// Interior rectangle persons are confined to while the community is active.
    #[must_use]
    pub fn interior(&self) -> Rect {
        self.region.interior()
    }

    /// Whether the community currently bounds its members.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Toggle whether the community bounds its members.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Square arrival zone anchored at the outer bottom-right corner.
    #[must_use]
    pub fn hub(&self) -> Rect {
        let half = self.hub_size * 0.5;
        let max = self.region.outer().max_corner();
        Rect::new(max - Vec2::splat(half), Vec2::splat(self.hub_size))
    }
}

/// Handles to the bounding areas a person belongs to.
///
/// The community takes precedence while active; otherwise the fallback
/// region confines the person.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub community: CommunityId,
    pub region: RegionId,
}

/// The bounding area currently confining a person.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveArea {
    /// Confined by an active community.
    Community(CommunityId),
    /// Confined by the fallback region.
    Region(RegionId),
}

/// Errors surfaced while validating configuration or building a world.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The spatial index rejected its configuration.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Static configuration for a pandemos world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Radius of each person in world units.
    pub person_radius: f32,
    /// Movement speed in world units per second.
    pub person_speed: f32,
    /// Distance under which two persons count as neighbors.
    pub distancing_radius: f32,
    /// Distance under which transmission can occur during a spread event.
    pub infection_radius: f32,
    /// Chance per step that a person adjusts their heading.
    pub wander_chance: f64,
    /// Maximum wander adjustment in degrees to either side.
    pub wander_turn_degrees: f32,
    /// Distance from a wall at which avoidance kicks in.
    pub wall_margin: f32,
    /// Chance that a wall bounce re-scatters the heading.
    pub wall_scatter_chance: f64,
    /// Maximum wall scatter in degrees to either side.
    pub wall_scatter_degrees: f32,
    /// Seconds an infection lasts before it is forced to resolve.
    pub max_infection_secs: f64,
    /// Seconds between infection events for an infected person.
    pub infection_event_interval: f64,
    /// Chance per event that an infected person attempts to spread.
    pub spread_chance: f64,
    /// Transmission chance against a susceptible neighbor.
    pub infection_chance: f64,
    /// Transmission chance against a recovered neighbor.
    pub reinfection_chance: f64,
    /// Chance per event that the infection resolves early.
    pub early_termination_chance: f64,
    /// Chance that a resolving infection is fatal.
    pub mortality_chance: f64,
    /// Chance that a newly infected person social distances.
    pub infected_distancer_chance: f64,
    /// Chance that a newly recovered person social distances.
    pub recovered_distancer_chance: f64,
    /// Upper bound in seconds for staggering a fresh infection's first event.
    pub event_stagger_secs: f64,
    /// Repulsion multiplier for the social distancing force.
    pub proximity_coefficient: f32,
    /// Speed multiplier applied while traveling between communities.
    pub travel_speed_multiplier: f32,
    /// Seconds between travel dispatches in the driver.
    pub travel_interval: f64,
    /// Side length of the square hub travelers steer for.
    pub hub_size: f32,
    /// Border inset applied to regions and communities.
    pub border_thickness: f32,
    /// Number of samples retained by the chart recorder.
    pub chart_width: usize,
    /// Seconds of simulated time between chart samples.
    pub chart_sample_interval: f64,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            person_radius: 5.0,
            person_speed: 120.0,
            distancing_radius: 125.0,
            infection_radius: 50.0,
            wander_chance: 0.5,
            wander_turn_degrees: 10.0,
            wall_margin: 10.0,
            wall_scatter_chance: 0.5,
            wall_scatter_degrees: 80.0,
            max_infection_secs: 60.0,
            infection_event_interval: 3.0,
            spread_chance: 0.33,
            infection_chance: 0.5,
            reinfection_chance: 0.1,
            early_termination_chance: 0.02,
            mortality_chance: 0.1,
            infected_distancer_chance: 0.7,
            recovered_distancer_chance: 0.6,
            event_stagger_secs: 5.0,
            proximity_coefficient: 10.0,
            travel_speed_multiplier: 3.0,
            travel_interval: 2.0,
            hub_size: 30.0,
            border_thickness: 10.0,
            chart_width: 256,
            chart_sample_interval: 1.0,
            rng_seed: None,
        }
    }
}

impl SimConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), WorldError> {
        let probabilities = [
            (self.wander_chance, "wander_chance must lie in [0, 1]"),
            (
                self.wall_scatter_chance,
                "wall_scatter_chance must lie in [0, 1]",
            ),
            (self.spread_chance, "spread_chance must lie in [0, 1]"),
            (self.infection_chance, "infection_chance must lie in [0, 1]"),
            (
                self.reinfection_chance,
                "reinfection_chance must lie in [0, 1]",
            ),
            (
                self.early_termination_chance,
                "early_termination_chance must lie in [0, 1]",
            ),
            (self.mortality_chance, "mortality_chance must lie in [0, 1]"),
            (
                self.infected_distancer_chance,
                "infected_distancer_chance must lie in [0, 1]",
            ),
            (
                self.recovered_distancer_chance,
                "recovered_distancer_chance must lie in [0, 1]",
            ),
        ];
        for (value, message) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(WorldError::InvalidConfig(message));
            }
        }
        if self.person_radius <= 0.0 {
            return Err(WorldError::InvalidConfig("person_radius must be positive"));
        }
        if self.person_speed < 0.0 {
            return Err(WorldError::InvalidConfig(
                "person_speed must be non-negative",
            ));
        }
        if self.distancing_radius <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "distancing_radius must be positive",
            ));
        }
        if self.infection_radius <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "infection_radius must be positive",
            ));
        }
        if self.infection_radius > self.distancing_radius {
            return Err(WorldError::InvalidConfig(
                "infection_radius cannot exceed distancing_radius",
            ));
        }
        if self.max_infection_secs <= 0.0
            || self.infection_event_interval <= 0.0
            || self.travel_interval <= 0.0
            || self.chart_sample_interval <= 0.0
        {
            return Err(WorldError::InvalidConfig("intervals must be positive"));
        }
        if self.event_stagger_secs < 0.0 {
            return Err(WorldError::InvalidConfig(
                "event_stagger_secs must be non-negative",
            ));
        }
        if self.wander_turn_degrees < 0.0
            || self.wall_scatter_degrees < 0.0
            || self.wall_margin < 0.0
        {
            return Err(WorldError::InvalidConfig(
                "turn angles and wall margin must be non-negative",
            ));
        }
        if self.proximity_coefficient < 0.0 {
            return Err(WorldError::InvalidConfig(
                "proximity_coefficient must be non-negative",
            ));
        }
        if self.travel_speed_multiplier < 0.0 {
            return Err(WorldError::InvalidConfig(
                "travel_speed_multiplier must be non-negative",
            ));
        }
        if self.hub_size <= 0.0 {
            return Err(WorldError::InvalidConfig("hub_size must be positive"));
        }
        if self.border_thickness < 0.0 {
            return Err(WorldError::InvalidConfig(
                "border_thickness must be non-negative",
            ));
        }
        if self.chart_width == 0 {
            return Err(WorldError::InvalidConfig("chart_width must be non-zero"));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Monotonic display identifier assigned at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PersonId(pub u64);

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Autonomous person moving through the simulation.
#[derive(Debug, Clone, Copy)]
pub struct Person {
    id: PersonId,
    position: Vec2,
    direction: Vec2,
    state: HealthState,
    distancing: bool,
    bounds: Bounds,
    travel_target: Option<CommunityId>,
    infected_since: Option<f64>,
    infected_until: Option<f64>,
    last_event: f64,
}

impl Person {
    /// Monotonic display identifier.
    #[must_use]
    pub const fn id(&self) -> PersonId {
        self.id
    }

    /// Current position in world units.
    #[must_use]
    pub const fn position(&self) -> Vec2 {
        self.position
    }

    /// Unit heading vector.
    #[must_use]
    pub const fn direction(&self) -> Vec2 {
        self.direction
    }

    /// Current infection state.
    #[must_use]
    pub const fn state(&self) -> HealthState {
        self.state
    }

    /// Whether the person applies the distancing force.
    #[must_use]
    pub const fn is_distancing(&self) -> bool {
        self.distancing
    }

    /// Bounding handles.
    #[must_use]
    pub const fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Community the person is traveling towards, if any.
    #[must_use]
    pub const fn travel_target(&self) -> Option<CommunityId> {
        self.travel_target
    }

    /// Simulation time the current or latest infection started.
    #[must_use]
    pub const fn infected_since(&self) -> Option<f64> {
        self.infected_since
    }

    /// Simulation time the latest infection resolved.
    #[must_use]
    pub const fn infected_until(&self) -> Option<f64> {
        self.infected_until
    }

    /// Display color derived from the infection state.
    #[must_use]
    pub const fn color(&self) -> Rgb {
        self.state.color()
    }
}

/// Live control surface values read once per step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Controls {
    /// Percentage of the population that should social distance.
    pub distancing_percent: f32,
    /// Weight of the distancing force when blended into a heading.
    pub distancing_strength: f32,
    /// Whether the distancing force is applied at all.
    pub distancing_enabled: bool,
    /// Whether travel dispatches are allowed.
    pub traveling_enabled: bool,
    /// Whether communities partition the population.
    pub communities_enabled: bool,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            distancing_percent: 100.0,
            distancing_strength: 1.0,
            distancing_enabled: false,
            traveling_enabled: true,
            communities_enabled: true,
        }
    }
}

/// Population totals broken down by infection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub susceptible: usize,
    pub infected: usize,
    pub recovered: usize,
    pub deceased: usize,
    /// Persons currently flagged as social distancers.
    pub distancing: usize,
}

impl StateCounts {
    /// Total population.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.susceptible + self.infected + self.recovered + self.deceased
    }

    /// Fractions in chart series order (infected, recovered, susceptible,
    /// deceased). An empty population yields all zeros.
    #[must_use]
    pub fn fractions(&self) -> [f32; 4] {
        let total = self.total();
        if total == 0 {
            return [0.0; 4];
        }
        let total = total as f32;
        [
            self.infected as f32 / total,
            self.recovered as f32 / total,
            self.susceptible as f32 / total,
            self.deceased as f32 / total,
        ]
    }
}

/// Summary of the state changes produced by a single step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    /// Simulation time in seconds at the end of the step.
    pub time: f64,
    /// Step counter after the step.
    pub tick: u64,
    /// Population aggregates at the end of the step.
    pub counts: StateCounts,
    /// Persons newly infected during the step.
    pub new_infections: usize,
    /// Persons who recovered during the step.
    pub new_recoveries: usize,
    /// Persons who died during the step.
    pub new_deaths: usize,
    /// Travelers that reached their destination during the step.
    pub travel_arrivals: usize,
    /// Whether a distancing-percent change triggered a roster rebalance.
    pub rebalanced: bool,
}

/// Entry recorded in the chart's rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ChartEntry {
    /// Population fractions in series order (infected, recovered,
    /// susceptible, deceased).
    Fractions([f32; 4]),
    /// Event marker column drawn in the given color.
    Marker(Rgb),
}

/// Rolling fixed-width recorder of population breakdowns.
///
/// The window always holds exactly `width` entries; appending evicts the
/// oldest. New recorders start with a fully susceptible window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chart {
    width: usize,
    sample_interval: f64,
    entries: VecDeque<ChartEntry>,
    last_sample: f64,
    pending_marker: Option<Rgb>,
}

impl Chart {
    /// Create a recorder holding `width` samples taken every
    /// `sample_interval` seconds of simulated time.
    #[must_use]
    pub fn new(width: usize, sample_interval: f64) -> Self {
        let mut entries = VecDeque::with_capacity(width);
        entries.extend(
            std::iter::repeat(ChartEntry::Fractions([0.0, 0.0, 1.0, 0.0])).take(width),
        );
        Self {
            width,
            sample_interval,
            entries,
            last_sample: 0.0,
            pending_marker: None,
        }
    }

    /// Record a sample if the interval elapsed, consuming a pending event
    /// marker instead of data when one is queued. Returns whether an entry
    /// was appended.
    pub fn record(&mut self, now: f64, counts: &StateCounts) -> bool {
        if now - self.last_sample < self.sample_interval {
            return false;
        }
        let entry = match self.pending_marker.take() {
            Some(color) => ChartEntry::Marker(color),
            None => ChartEntry::Fractions(counts.fractions()),
        };
        self.entries.push_back(entry);
        while self.entries.len() > self.width {
            self.entries.pop_front();
        }
        self.last_sample = now;
        true
    }

    /// Queue an event marker; the next sample slot is drawn in `color`
    /// instead of data. A queued marker is replaced, not stacked.
    pub fn mark_event(&mut self, color: Rgb) {
        self.pending_marker = Some(color);
    }

    /// Entries oldest to newest.
    #[must_use]
    pub const fn entries(&self) -> &VecDeque<ChartEntry> {
        &self.entries
    }

    /// Configured window width.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct InfectionTally {
    infections: usize,
    recoveries: usize,
    deaths: usize,
}

/// Complete simulation state: population, bounding areas, clock, and RNG.
pub struct World {
    config: SimConfig,
    rng: SmallRng,
    time: f64,
    tick: u64,
    persons: SlotMap<PersonKey, Person>,
    regions: SlotMap<RegionId, Region>,
    communities: SlotMap<CommunityId, Community>,
    community_order: Vec<CommunityId>,
    rotation_cursor: usize,
    next_person_id: u64,
    index: UniformGridIndex,
    index_keys: Vec<PersonKey>,
    positions_scratch: Vec<(f32, f32)>,
    neighbors: PersonMap<Vec<PersonKey>>,
    start_positions: PersonMap<Vec2>,
    last_distancing_percent: Option<f32>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("time", &self.time)
            .field("tick", &self.tick)
            .field("population", &self.persons.len())
            .field("communities", &self.communities.len())
            .finish()
    }
}

impl World {
    /// Construct an empty world from a validated configuration.
    pub fn new(config: SimConfig) -> Result<Self, WorldError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let index = UniformGridIndex::new(config.distancing_radius)?;
        Ok(Self {
            config,
            rng,
            time: 0.0,
            tick: 0,
            persons: SlotMap::with_key(),
            regions: SlotMap::with_key(),
            communities: SlotMap::with_key(),
            community_order: Vec::new(),
            rotation_cursor: 0,
            next_person_id: 0,
            index,
            index_keys: Vec::new(),
            positions_scratch: Vec::new(),
            neighbors: PersonMap::new(),
            start_positions: PersonMap::new(),
            last_distancing_percent: None,
        })
    }

    /// Immutable access to the configuration.
    #[must_use]
    pub const fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Elapsed simulation time in seconds.
    #[must_use]
    pub const fn time(&self) -> f64 {
        self.time
    }

    /// Number of completed steps.
    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Number of persons, deceased included.
    #[must_use]
    pub fn population(&self) -> usize {
        self.persons.len()
    }

    /// Iterate over all persons.
    pub fn persons(&self) -> impl Iterator<Item = (PersonKey, &Person)> {
        self.persons.iter()
    }

    /// Look up a person by handle.
    #[must_use]
    pub fn person(&self, key: PersonKey) -> Option<&Person> {
        self.persons.get(key)
    }

    /// Look up a region by handle.
    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(id)
    }

    /// Look up a community by handle.
    #[must_use]
    pub fn community(&self, id: CommunityId) -> Option<&Community> {
        self.communities.get(id)
    }

    /// Iterate over all communities.
    pub fn communities(&self) -> impl Iterator<Item = (CommunityId, &Community)> {
        self.communities.iter()
    }

    /// Community handles in registration order.
    #[must_use]
    pub fn community_order(&self) -> &[CommunityId] {
        &self.community_order
    }

    /// Neighbor handles resolved for `key` during the latest step.
    #[must_use]
    pub fn neighbors_of(&self, key: PersonKey) -> &[PersonKey] {
        self.neighbors.get(key).map_or(&[], Vec::as_slice)
    }

    /// Register a region, returning its handle.
    pub fn add_region(&mut self, region: Region) -> RegionId {
        self.regions.insert(region)
    }

    /// Register a community, returning its handle. Registration order drives
    /// the placement rotation.
    pub fn add_community(&mut self, community: Community) -> CommunityId {
        let id = self.communities.insert(community);
        self.community_order.push(id);
        id
    }

    /// The bounding area currently confining a person with `bounds`.
    #[must_use]
    pub fn active_area(&self, bounds: Bounds) -> ActiveArea {
        if self
            .communities
            .get(bounds.community)
            .is_some_and(Community::is_active)
        {
            ActiveArea::Community(bounds.community)
        } else {
            ActiveArea::Region(bounds.region)
        }
    }

    /// Interior rectangle of the area currently confining `bounds`.
    #[must_use]
    pub fn active_rect(&self, bounds: Bounds) -> Rect {
        match self.active_area(bounds) {
            ActiveArea::Community(id) => self.communities[id].interior(),
            ActiveArea::Region(id) => self.regions[id].interior(),
        }
    }

    /// Aggregate population totals.
    #[must_use]
    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for person in self.persons.values() {
            match person.state {
                HealthState::Susceptible => counts.susceptible += 1,
                HealthState::Infected => counts.infected += 1,
                HealthState::Recovered => counts.recovered += 1,
                HealthState::Deceased => counts.deceased += 1,
            }
            if person.distancing {
                counts.distancing += 1;
            }
        }
        counts
    }

    /// Advance the world by one frame of `frametime` seconds.
    pub fn step(&mut self, frametime: f64, controls: &Controls) -> TickReport {
        let dt = frametime.max(0.0);
        self.tick += 1;
        self.time += dt;
        let now = self.time;

        let rebalanced = self.stage_sync_controls(controls);
        self.stage_neighbors();
        let tally = self.stage_infection(now);
        let arrived = self.stage_travel(dt);
        self.stage_motion(dt, controls, &arrived);

        TickReport {
            time: now,
            tick: self.tick,
            counts: self.state_counts(),
            new_infections: tally.infections,
            new_recoveries: tally.recoveries,
            new_deaths: tally.deaths,
            travel_arrivals: arrived.len(),
            rebalanced,
        }
    }

    /// Mirror control toggles into the area tables and fire the distancing
    /// rebalance when the percent value changed since the previous step.
    fn stage_sync_controls(&mut self, controls: &Controls) -> bool {
        for community in self.communities.values_mut() {
            community.set_active(controls.communities_enabled);
        }
        let percent = controls.distancing_percent;
        let changed = self
            .last_distancing_percent
            .is_some_and(|last| last != percent);
        self.last_distancing_percent = Some(percent);
        if changed {
            self.rebalance_distancers(percent);
        }
        changed
    }

    /// Rebuild the broad-phase index and resolve per-person neighbor sets
    /// from the positions persons hold at the start of the step.
    fn stage_neighbors(&mut self) {
        self.index_keys.clear();
        self.positions_scratch.clear();
        self.start_positions.clear();
        for (key, person) in &self.persons {
            self.index_keys.push(key);
            self.positions_scratch.push((person.position.x, person.position.y));
            self.start_positions.insert(key, person.position);
        }
        self.index.rebuild(&self.positions_scratch);

        let radius_sq = self.config.distancing_radius * self.config.distancing_radius;
        self.neighbors.clear();
        let persons = &self.persons;
        let communities = &self.communities;
        let index = &self.index;
        let index_keys = &self.index_keys;
        let area_of = |bounds: Bounds| -> ActiveArea {
            if communities
                .get(bounds.community)
                .is_some_and(Community::is_active)
            {
                ActiveArea::Community(bounds.community)
            } else {
                ActiveArea::Region(bounds.region)
            }
        };
        for (slot, &key) in index_keys.iter().enumerate() {
            let person = &persons[key];
            let mut set = Vec::new();
            if person.state != HealthState::Deceased && person.travel_target.is_none() {
                let area = area_of(person.bounds);
                index.neighbors_within(
                    slot,
                    radius_sq,
                    &mut |other_slot: usize, dist_sq: OrderedFloat<f32>| {
                        let other_key = index_keys[other_slot];
                        let other = &persons[other_key];
                        if other.state == HealthState::Deceased
                            || other.travel_target.is_some()
                            || area_of(other.bounds) != area
                        {
                            return;
                        }
                        if dist_sq.into_inner() < radius_sq {
                            set.push(other_key);
                        }
                    },
                );
            }
            self.neighbors.insert(key, set);
        }
    }

    /// Run infection events for everyone infected at the start of the step.
    ///
    /// Transmissions and resolutions are collected against start-of-step
    /// state and applied afterwards, so a person exposed twice in one step
    /// is infected once and nobody transitions twice.
    fn stage_infection(&mut self, now: f64) -> InfectionTally {
        let infection_radius_sq = self.config.infection_radius * self.config.infection_radius;
        let mut resolutions: Vec<PersonKey> = Vec::new();
        let mut event_fired: Vec<PersonKey> = Vec::new();
        let mut transmissions: Vec<PersonKey> = Vec::new();

        let persons = &self.persons;
        let neighbors = &self.neighbors;
        let start_positions = &self.start_positions;
        let config = &self.config;
        let rng = &mut self.rng;

        for (key, person) in persons {
            if person.state != HealthState::Infected || person.travel_target.is_some() {
                continue;
            }
            let Some(started) = person.infected_since else {
                panic!("person {} is infected with no start time", person.id);
            };
            if now - started >= config.max_infection_secs {
                resolutions.push(key);
                continue;
            }
            if now - person.last_event < config.infection_event_interval {
                continue;
            }
            if rng.random::<f64>() < config.spread_chance {
                if let (Some(set), Some(&origin)) = (neighbors.get(key), start_positions.get(key)) {
                    for &other_key in set {
                        let Some(&other_pos) = start_positions.get(other_key) else {
                            continue;
                        };
                        if origin.distance_squared(other_pos) >= infection_radius_sq {
                            continue;
                        }
                        let chance = match persons[other_key].state {
                            HealthState::Susceptible => config.infection_chance,
                            HealthState::Recovered => config.reinfection_chance,
                            HealthState::Infected | HealthState::Deceased => continue,
                        };
                        if rng.random::<f64>() < chance {
                            transmissions.push(other_key);
                        }
                    }
                }
            }
            if rng.random::<f64>() < config.early_termination_chance {
                resolutions.push(key);
            }
            event_fired.push(key);
        }

        for key in event_fired {
            self.persons[key].last_event = now;
        }
        let mut tally = InfectionTally::default();
        for key in resolutions {
            if self.resolve_infection(key, now) {
                tally.deaths += 1;
            } else {
                tally.recoveries += 1;
            }
        }
        for key in transmissions {
            if matches!(
                self.persons[key].state,
                HealthState::Susceptible | HealthState::Recovered
            ) {
                self.infect_now(key, now);
                tally.infections += 1;
            }
        }
        tally
    }

    /// Steer travelers straight at their target hub and complete arrivals.
    fn stage_travel(&mut self, dt: f64) -> Vec<PersonKey> {
        let step = self.config.person_speed * self.config.travel_speed_multiplier * dt as f32;
        let mut arrived = Vec::new();
        let communities = &self.communities;
        for (key, person) in self.persons.iter_mut() {
            let Some(target) = person.travel_target else {
                continue;
            };
            let hub = communities[target].hub();
            let to_target = hub.center - person.position;
            if to_target.length_squared() > 0.0 {
                person.direction = to_target.normalize();
            }
            person.position += person.direction * step;
            if hub.contains(person.position) {
                person.bounds.community = target;
                person.travel_target = None;
                arrived.push(key);
                debug!(person = %person.id, community = ?target, "travel complete");
            }
        }
        arrived
    }

    /// Wander, avoid walls, apply the distancing force, move, and clamp.
    ///
    /// Persons that completed a travel leg this step sit the stage out; their
    /// regular motion resumes next step.
    fn stage_motion(&mut self, dt: f64, controls: &Controls, arrived: &[PersonKey]) {
        let step = self.config.person_speed * dt as f32;
        let keys: Vec<PersonKey> = self.persons.keys().collect();
        for key in keys {
            let Some(&start) = self.persons.get(key) else {
                continue;
            };
            if start.state == HealthState::Deceased
                || start.travel_target.is_some()
                || arrived.contains(&key)
            {
                continue;
            }
            let rect = self.active_rect(start.bounds);
            let mut direction = start.direction;

            if self.rng.random::<f64>() < self.config.wander_chance {
                let turn = self
                    .rng
                    .random_range(-self.config.wander_turn_degrees..=self.config.wander_turn_degrees);
                direction = Vec2::from_angle(turn.to_radians()).rotate(direction);
            }

            let margin = self.config.wall_margin;
            let snapped = if (start.position.x - rect.left()).abs() < margin {
                direction = Vec2::X;
                true
            } else if (start.position.x - rect.right()).abs() < margin {
                direction = -Vec2::X;
                true
            } else if (start.position.y - rect.top()).abs() < margin {
                direction = Vec2::Y;
                true
            } else if (start.position.y - rect.bottom()).abs() < margin {
                direction = -Vec2::Y;
                true
            } else {
                false
            };
            if snapped && self.rng.random::<f64>() < self.config.wall_scatter_chance {
                let turn = self.rng.random_range(
                    -self.config.wall_scatter_degrees..=self.config.wall_scatter_degrees,
                );
                direction = Vec2::from_angle(turn.to_radians()).rotate(direction);
            }

            if controls.distancing_enabled && start.distancing {
                direction = self.distanced_direction(key, direction, controls.distancing_strength);
            }

            let moved = start.position + direction * step;
            let person = &mut self.persons[key];
            person.direction = direction;
            person.position = rect.clamp_point(moved, self.config.person_radius);
        }
    }

    /// Blend the averaged repulsion from this step's neighbors into
    /// `direction`. Falls back to the unchanged heading whenever the force
    /// degenerates.
    fn distanced_direction(&self, key: PersonKey, direction: Vec2, strength: f32) -> Vec2 {
        let Some(neighbor_keys) = self.neighbors.get(key) else {
            return direction;
        };
        if neighbor_keys.is_empty() {
            return direction;
        }
        let Some(&my_pos) = self.start_positions.get(key) else {
            return direction;
        };
        let radius = self.config.distancing_radius;
        let mut total = Vec2::ZERO;
        let mut contributors = 0u32;
        for &other in neighbor_keys {
            let Some(&other_pos) = self.start_positions.get(other) else {
                continue;
            };
            let away = my_pos - other_pos;
            let distance = away.length();
            if distance == 0.0 {
                continue;
            }
            let weight = self.config.proximity_coefficient * (1.0 - distance / radius).powi(2);
            total += away * weight;
            contributors += 1;
        }
        if contributors == 0 {
            return direction;
        }
        let force = (total / contributors as f32).normalize_or_zero();
        let blended = direction + force * strength;
        if blended.length_squared() > 0.0 {
            blended.normalize()
        } else {
            direction
        }
    }

    fn resolve_infection(&mut self, key: PersonKey, now: f64) -> bool {
        let fatal = self.rng.random::<f64>() < self.config.mortality_chance;
        let distancing = if fatal {
            false
        } else {
            self.rng.random::<f64>() < self.config.recovered_distancer_chance
        };
        let person = &mut self.persons[key];
        person.infected_until = Some(now);
        let duration = person.infected_since.map_or(0.0, |started| now - started);
        if fatal {
            person.state = HealthState::Deceased;
            debug!(person = %person.id, duration, "died");
        } else {
            person.state = HealthState::Recovered;
            person.distancing = distancing;
            debug!(person = %person.id, duration, "recovered");
        }
        fatal
    }

    fn infect_now(&mut self, key: PersonKey, now: f64) {
        let stagger = self.rng.random::<f64>() * self.config.event_stagger_secs;
        let distancing = self.rng.random::<f64>() < self.config.infected_distancer_chance;
        let person = &mut self.persons[key];
        person.state = HealthState::Infected;
        person.infected_since = Some(now);
        person.infected_until = None;
        person.last_event = (now - stagger).max(0.0);
        person.distancing = distancing;
        debug!(person = %person.id, "infected");
    }

    /// Spawn a person into `bounds`, at `position` or a uniform random point
    /// inside the currently confining area. The distancing flag is rolled
    /// from the live distancing percent.
    pub fn add_person(
        &mut self,
        bounds: Bounds,
        position: Option<Vec2>,
        controls: &Controls,
    ) -> PersonKey {
        let rect = self.active_rect(bounds);
        let position = match position {
            Some(position) => position,
            None => self.sample_spawn_point(rect),
        };
        let direction = self.sample_direction();
        let distancing = self.rng.random::<f64>() < f64::from(controls.distancing_percent) / 100.0;
        let id = PersonId(self.next_person_id);
        self.next_person_id += 1;
        self.persons.insert(Person {
            id,
            position,
            direction,
            state: HealthState::Susceptible,
            distancing,
            bounds,
            travel_target: None,
            infected_since: None,
            infected_until: None,
            last_event: 0.0,
        })
    }

    /// Spawn `count` persons, rotating round-robin across registered
    /// communities. Returns the number actually spawned.
    pub fn add_people(&mut self, count: usize, region: RegionId, controls: &Controls) -> usize {
        if self.community_order.is_empty() {
            debug!(requested = count, "no communities registered for placement");
            return 0;
        }
        for _ in 0..count {
            let community = self.next_community();
            self.add_person(Bounds { community, region }, None, controls);
        }
        count
    }

    /// Remove up to `count` persons. With communities enabled the rotation
    /// cursor picks the pool, falling back to the whole population when a
    /// full rotation finds every community empty.
    pub fn remove_people(&mut self, count: usize, controls: &Controls) -> usize {
        let mut removed = 0;
        for _ in 0..count {
            if self.persons.is_empty() {
                break;
            }
            let picked = if controls.communities_enabled && !self.community_order.is_empty() {
                self.pick_removal_by_rotation()
            } else {
                self.pick_uniform()
            };
            let Some(key) = picked else {
                break;
            };
            if let Some(person) = self.persons.remove(key) {
                self.neighbors.remove(key);
                self.start_positions.remove(key);
                debug!(person = %person.id, "removed");
                removed += 1;
            }
        }
        removed
    }

    /// Infect one uniformly chosen susceptible or recovered person.
    pub fn infect_one(&mut self) -> Option<PersonId> {
        let now = self.time;
        let pool: Vec<PersonKey> = self
            .persons
            .iter()
            .filter(|(_, person)| {
                matches!(
                    person.state,
                    HealthState::Susceptible | HealthState::Recovered
                )
            })
            .map(|(key, _)| key)
            .collect();
        let key = pool.choose(&mut self.rng).copied()?;
        self.infect_now(key, now);
        Some(self.persons[key].id)
    }

    /// Clear every distancing flag, then set it on a fresh uniform sample
    /// sized from the live distancing percent. Returns the sample size.
    pub fn randomize_distancers(&mut self, controls: &Controls) -> usize {
        for person in self.persons.values_mut() {
            person.distancing = false;
        }
        let target = self.distancer_target(controls.distancing_percent);
        let keys: Vec<PersonKey> = self.persons.keys().collect();
        let chosen: Vec<PersonKey> = keys.choose_multiple(&mut self.rng, target).copied().collect();
        for &key in &chosen {
            self.persons[key].distancing = true;
        }
        debug!(distancers = chosen.len(), "distancing roster randomized");
        chosen.len()
    }

    /// Flip just enough uniformly sampled flags for the distancer count to
    /// meet `percent` of the population. Returns the number of flips.
    pub fn rebalance_distancers(&mut self, percent: f32) -> usize {
        let target = self.distancer_target(percent);
        let current = self
            .persons
            .values()
            .filter(|person| person.distancing)
            .count();
        let (pool, set_to): (Vec<PersonKey>, bool) = if target > current {
            (
                self.persons
                    .iter()
                    .filter(|(_, person)| !person.distancing)
                    .map(|(key, _)| key)
                    .collect(),
                true,
            )
        } else if target < current {
            (
                self.persons
                    .iter()
                    .filter(|(_, person)| person.distancing)
                    .map(|(key, _)| key)
                    .collect(),
                false,
            )
        } else {
            return 0;
        };
        let flips = target.abs_diff(current);
        let chosen: Vec<PersonKey> = pool.choose_multiple(&mut self.rng, flips).copied().collect();
        for &key in &chosen {
            self.persons[key].distancing = set_to;
        }
        debug!(flips = chosen.len(), target, "distancing roster rebalanced");
        chosen.len()
    }

    /// Send one uniformly chosen living, non-traveling person towards a
    /// uniformly chosen other community. Requires at least two communities.
    pub fn travel_one(&mut self) -> Option<PersonId> {
        if self.community_order.len() < 2 {
            return None;
        }
        let pool: Vec<PersonKey> = self
            .persons
            .iter()
            .filter(|(_, person)| {
                person.state != HealthState::Deceased && person.travel_target.is_none()
            })
            .map(|(key, _)| key)
            .collect();
        let key = pool.choose(&mut self.rng).copied()?;
        let current = self.persons[key].bounds.community;
        let options: Vec<CommunityId> = self
            .community_order
            .iter()
            .copied()
            .filter(|&id| id != current)
            .collect();
        let target = options.choose(&mut self.rng).copied()?;
        let person = &mut self.persons[key];
        person.travel_target = Some(target);
        debug!(person = %person.id, community = ?target, "travel dispatched");
        Some(person.id)
    }

    fn distancer_target(&self, percent: f32) -> usize {
        let population = self.persons.len();
        ((f64::from(percent) / 100.0) * population as f64).round() as usize
    }

    fn next_community(&mut self) -> CommunityId {
        let id = self.community_order[self.rotation_cursor % self.community_order.len()];
        self.rotation_cursor = (self.rotation_cursor + 1) % self.community_order.len();
        id
    }

    fn pick_removal_by_rotation(&mut self) -> Option<PersonKey> {
        for _ in 0..self.community_order.len() {
            let community = self.next_community();
            let pool: Vec<PersonKey> = self
                .persons
                .iter()
                .filter(|(_, person)| person.bounds.community == community)
                .map(|(key, _)| key)
                .collect();
            if let Some(&key) = pool.choose(&mut self.rng) {
                return Some(key);
            }
        }
        self.pick_uniform()
    }

    fn pick_uniform(&mut self) -> Option<PersonKey> {
        let keys: Vec<PersonKey> = self.persons.keys().collect();
        keys.choose(&mut self.rng).copied()
    }

    fn sample_spawn_point(&mut self, rect: Rect) -> Vec2 {
        let inset = self.config.person_radius;
        let min = rect.min_corner() + Vec2::splat(inset);
        let max = rect.max_corner() - Vec2::splat(inset);
        if max.x < min.x || max.y < min.y {
            return rect.center;
        }
        Vec2::new(
            self.rng.random_range(min.x..=max.x),
            self.rng.random_range(min.y..=max.y),
        )
    }

    fn sample_direction(&mut self) -> Vec2 {
        let direction = Vec2::new(
            self.rng.random_range(-1.0..=1.0),
            self.rng.random_range(-1.0..=1.0),
        )
        .normalize_or_zero();
        if direction == Vec2::ZERO {
            Vec2::X
        } else {
            direction
        }
    }
}

/// Owns a world plus its chart recorder and advances them together.
#[derive(Debug)]
pub struct Simulation {
    world: World,
    chart: Chart,
}

impl Simulation {
    /// Build a simulation from configuration.
    pub fn new(config: SimConfig) -> Result<Self, WorldError> {
        let chart = Chart::new(config.chart_width, config.chart_sample_interval);
        let world = World::new(config)?;
        Ok(Self { world, chart })
    }

    /// Advance one frame and feed the chart from the resulting report.
    pub fn advance(&mut self, frametime: f64, controls: &Controls) -> TickReport {
        let report = self.world.step(frametime, controls);
        self.chart.record(report.time, &report.counts);
        report
    }

    /// Immutable access to the world.
    #[must_use]
    pub const fn world(&self) -> &World {
        &self.world
    }

    /// Mutable access to the world (for population operations).
    #[must_use]
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Immutable access to the chart recorder.
    #[must_use]
    pub const fn chart(&self) -> &Chart {
        &self.chart
    }

    /// Mutable access to the chart recorder (for event markers).
    #[must_use]
    pub fn chart_mut(&mut self) -> &mut Chart {
        &mut self.chart
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 1.0 / 120.0;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    fn quiet_config() -> SimConfig {
        SimConfig {
            rng_seed: Some(42),
            wander_chance: 0.0,
            wall_scatter_chance: 0.0,
            early_termination_chance: 0.0,
            ..SimConfig::default()
        }
    }

    fn off_controls() -> Controls {
        Controls {
            distancing_percent: 0.0,
            distancing_enabled: false,
            ..Controls::default()
        }
    }

    fn quad_world(config: SimConfig) -> (World, RegionId, Vec<CommunityId>) {
        let border = config.border_thickness;
        let hub = config.hub_size;
        let mut world = World::new(config).expect("world");
        let region = world.add_region(Region::new(
            "Field",
            Rect::new(Vec2::new(500.0, 500.0), Vec2::new(1000.0, 1000.0)),
            border,
        ));
        let mut communities = Vec::new();
        for (label, center) in [
            ("TL", Vec2::new(250.0, 250.0)),
            ("TR", Vec2::new(750.0, 250.0)),
            ("BR", Vec2::new(750.0, 750.0)),
            ("BL", Vec2::new(250.0, 750.0)),
        ] {
            communities.push(world.add_community(Community::new(
                label,
                Rect::new(center, Vec2::new(500.0, 500.0)),
                border,
                hub,
            )));
        }
        (world, region, communities)
    }

    fn place(
        world: &mut World,
        region: RegionId,
        community: CommunityId,
        position: Vec2,
    ) -> PersonKey {
        world.add_person(
            Bounds { community, region },
            Some(position),
            &off_controls(),
        )
    }

    #[test]
    fn rect_edges_follow_screen_convention() {
        let rect = Rect::new(Vec2::new(50.0, 100.0), Vec2::new(20.0, 40.0));
        assert!(approx(rect.left(), 40.0));
        assert!(approx(rect.right(), 60.0));
        assert!(approx(rect.top(), 80.0));
        assert!(approx(rect.bottom(), 120.0));
        assert!(rect.contains(Vec2::new(40.0, 80.0)));
        assert!(rect.contains(Vec2::new(60.0, 120.0)));
        assert!(!rect.contains(Vec2::new(39.0, 100.0)));

        let interior = rect.inset(5.0);
        assert!(approx(interior.left(), 45.0));
        assert!(approx(interior.size.y, 30.0));
    }

    #[test]
    fn rect_clamps_points_inside_margin() {
        let rect = Rect::new(Vec2::new(0.0, 0.0), Vec2::new(100.0, 100.0));
        let clamped = rect.clamp_point(Vec2::new(80.0, -90.0), 5.0);
        assert!(approx(clamped.x, 45.0));
        assert!(approx(clamped.y, -45.0));
        let inside = rect.clamp_point(Vec2::new(1.0, 2.0), 5.0);
        assert_eq!(inside, Vec2::new(1.0, 2.0));
    }

    #[test]
    fn gradient_interpolates_and_clamps() {
        let gradient = Gradient::default();
        assert_eq!(gradient.color_at(-20.0), Rgb::new(0, 255, 0));
        assert_eq!(gradient.color_at(0.0), Rgb::new(0, 255, 0));
        assert_eq!(gradient.color_at(50.0), Rgb::new(127, 255, 0));
        assert_eq!(gradient.color_at(100.0), Rgb::new(255, 255, 0));
        assert_eq!(gradient.color_at(150.0), Rgb::new(255, 127, 0));
        assert_eq!(gradient.color_at(255.0), Rgb::new(255, 0, 0));
        assert_eq!(gradient.color_at(400.0), Rgb::new(255, 0, 0));
    }

    #[test]
    fn proximity_intensity_fades_with_distance() {
        assert!(approx(proximity_intensity(0.0, 125.0), 255.0));
        assert!(approx(proximity_intensity(62.5, 125.0), 127.5));
        assert!(approx(proximity_intensity(125.0, 125.0), 0.0));
        assert!(approx(proximity_intensity(300.0, 125.0), 0.0));
        assert!(approx(proximity_intensity(10.0, 0.0), 0.0));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        let config = SimConfig {
            spread_chance: 1.5,
            ..SimConfig::default()
        };
        let error = config.validate().expect_err("chance above one");
        assert!(error.to_string().contains("invalid configuration"));

        let config = SimConfig {
            infection_radius: 200.0,
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SimConfig {
            chart_width: 0,
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SimConfig {
            max_infection_secs: 0.0,
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn counts_fractions_follow_series_order() {
        let counts = StateCounts {
            susceptible: 2,
            infected: 1,
            recovered: 1,
            deceased: 0,
            distancing: 3,
        };
        assert_eq!(counts.total(), 4);
        let fractions = counts.fractions();
        assert!(approx(fractions[0], 0.25));
        assert!(approx(fractions[1], 0.25));
        assert!(approx(fractions[2], 0.5));
        assert!(approx(fractions[3], 0.0));
        assert_eq!(StateCounts::default().fractions(), [0.0; 4]);
    }

    #[test]
    fn chart_window_stays_fixed_width() {
        let mut chart = Chart::new(5, 1.0);
        assert_eq!(chart.entries().len(), 5);
        assert!(chart
            .entries()
            .iter()
            .all(|entry| *entry == ChartEntry::Fractions([0.0, 0.0, 1.0, 0.0])));

        let counts = StateCounts {
            susceptible: 1,
            ..StateCounts::default()
        };
        assert!(!chart.record(0.5, &counts));
        assert!(chart.record(1.0, &counts));
        assert!(!chart.record(1.5, &counts));
        assert!(chart.record(2.0, &counts));
        assert_eq!(chart.entries().len(), 5);
    }

    #[test]
    fn chart_marker_is_consumed_once() {
        let mut chart = Chart::new(4, 1.0);
        let counts = StateCounts {
            susceptible: 2,
            ..StateCounts::default()
        };
        chart.mark_event(Rgb::new(0, 255, 255));
        chart.mark_event(Rgb::new(255, 128, 0));
        assert!(chart.record(1.0, &counts));
        assert_eq!(
            chart.entries().back(),
            Some(&ChartEntry::Marker(Rgb::new(255, 128, 0)))
        );
        assert!(chart.record(2.0, &counts));
        assert_eq!(
            chart.entries().back(),
            Some(&ChartEntry::Fractions([0.0, 0.0, 1.0, 0.0]))
        );
    }

    #[test]
    fn chart_records_zeros_for_empty_population() {
        let mut chart = Chart::new(3, 1.0);
        assert!(chart.record(1.0, &StateCounts::default()));
        assert_eq!(
            chart.entries().back(),
            Some(&ChartEntry::Fractions([0.0; 4]))
        );
    }

    #[test]
    fn spawn_round_robins_communities_and_ids() {
        let (mut world, region, communities) = quad_world(quiet_config());
        let added = world.add_people(5, region, &off_controls());
        assert_eq!(added, 5);
        assert_eq!(world.population(), 5);

        let expected = [
            communities[0],
            communities[1],
            communities[2],
            communities[3],
            communities[0],
        ];
        for (index, (_, person)) in world.persons().enumerate() {
            assert_eq!(person.id(), PersonId(index as u64));
            assert_eq!(person.bounds().community, expected[index]);
            assert_eq!(person.state(), HealthState::Susceptible);
            assert!(approx(person.direction().length(), 1.0));
        }
    }

    #[test]
    fn spawned_positions_respect_bounds() {
        let (mut world, region, _) = quad_world(quiet_config());
        world.add_people(40, region, &off_controls());
        let radius = world.config().person_radius;
        for (_, person) in world.persons() {
            let rect = world.active_rect(person.bounds());
            let position = person.position();
            assert!(position.x >= rect.left() + radius - 1e-3);
            assert!(position.x <= rect.right() - radius + 1e-3);
            assert!(position.y >= rect.top() + radius - 1e-3);
            assert!(position.y <= rect.bottom() - radius + 1e-3);
        }
    }

    #[test]
    fn infect_one_singles_out_one_person() {
        let (mut world, region, _) = quad_world(quiet_config());
        world.add_people(10, region, &off_controls());
        let id = world.infect_one().expect("candidate available");
        let counts = world.state_counts();
        assert_eq!(counts.infected, 1);
        assert_eq!(counts.susceptible, 9);
        let (_, infected) = world
            .persons()
            .find(|(_, person)| person.id() == id)
            .expect("infected person");
        assert_eq!(infected.state(), HealthState::Infected);
        assert!(infected.infected_since().is_some());
        assert!(infected.infected_until().is_none());
    }

    #[test]
    fn infect_one_with_no_candidates_is_none() {
        let (mut world, region, _) = quad_world(quiet_config());
        world.add_people(3, region, &off_controls());
        for _ in 0..3 {
            assert!(world.infect_one().is_some());
        }
        assert!(world.infect_one().is_none());
    }

    #[test]
    fn randomize_distancers_hits_rounded_target() {
        let (mut world, region, _) = quad_world(quiet_config());
        world.add_people(10, region, &off_controls());
        let controls = Controls {
            distancing_percent: 30.0,
            ..Controls::default()
        };
        assert_eq!(world.randomize_distancers(&controls), 3);
        assert_eq!(world.state_counts().distancing, 3);
        assert_eq!(world.randomize_distancers(&controls), 3);
        assert_eq!(world.state_counts().distancing, 3);
    }

    #[test]
    fn rebalance_flips_exactly_the_difference() {
        let (mut world, region, _) = quad_world(quiet_config());
        world.add_people(10, region, &off_controls());
        assert_eq!(world.state_counts().distancing, 0);

        assert_eq!(world.rebalance_distancers(25.0), 3);
        assert_eq!(world.state_counts().distancing, 3);
        assert_eq!(world.rebalance_distancers(25.0), 0);
        assert_eq!(world.rebalance_distancers(0.0), 3);
        assert_eq!(world.state_counts().distancing, 0);
    }

    #[test]
    fn remove_people_rotates_communities() {
        let (mut world, region, communities) = quad_world(quiet_config());
        world.add_people(8, region, &off_controls());
        let removed = world.remove_people(4, &Controls::default());
        assert_eq!(removed, 4);
        assert_eq!(world.population(), 4);
        for &community in &communities {
            let remaining = world
                .persons()
                .filter(|(_, person)| person.bounds().community == community)
                .count();
            assert_eq!(remaining, 1);
        }
    }

    #[test]
    fn remove_people_caps_at_population() {
        let (mut world, region, _) = quad_world(quiet_config());
        world.add_people(3, region, &off_controls());
        let controls = Controls {
            communities_enabled: false,
            ..Controls::default()
        };
        assert_eq!(world.remove_people(10, &controls), 3);
        assert_eq!(world.population(), 0);
        assert_eq!(world.remove_people(10, &controls), 0);
    }

    #[test]
    fn step_keeps_people_inside_bounds() {
        let config = SimConfig {
            rng_seed: Some(7),
            ..SimConfig::default()
        };
        let (mut world, region, _) = quad_world(config);
        world.add_people(12, region, &off_controls());
        let controls = off_controls();
        for _ in 0..200 {
            world.step(DT, &controls);
        }
        let radius = world.config().person_radius;
        for (_, person) in world.persons() {
            let rect = world.active_rect(person.bounds());
            let position = person.position();
            assert!(position.x >= rect.left() + radius - 1e-3);
            assert!(position.x <= rect.right() - radius + 1e-3);
            assert!(position.y >= rect.top() + radius - 1e-3);
            assert!(position.y <= rect.bottom() - radius + 1e-3);
            assert!(approx(person.direction().length(), 1.0));
        }
    }

    #[test]
    fn deceased_people_never_move_or_interact() {
        let (mut world, region, communities) = quad_world(SimConfig {
            rng_seed: Some(3),
            ..SimConfig::default()
        });
        let dead = place(&mut world, region, communities[0], Vec2::new(200.0, 200.0));
        let alive = place(&mut world, region, communities[0], Vec2::new(220.0, 200.0));
        world.persons[dead].state = HealthState::Deceased;
        let frozen = world.person(dead).expect("person").position();

        let controls = off_controls();
        for _ in 0..50 {
            world.step(DT, &controls);
        }
        assert_eq!(world.person(dead).expect("person").position(), frozen);
        assert!(world.neighbors_of(dead).is_empty());
        assert!(world.neighbors_of(alive).is_empty());
    }

    #[test]
    fn wall_contact_snaps_direction_inward() {
        let (mut world, region, communities) = quad_world(quiet_config());
        let interior = world.community(communities[0]).expect("community").interior();
        let near_left = place(
            &mut world,
            region,
            communities[0],
            Vec2::new(interior.left() + 5.0, 250.0),
        );
        let corner = place(
            &mut world,
            region,
            communities[0],
            Vec2::new(interior.left() + 5.0, interior.top() + 5.0),
        );
        world.step(DT, &off_controls());
        assert_eq!(world.person(near_left).expect("person").direction(), Vec2::X);
        // left/right snapping wins over top/bottom in corners
        assert_eq!(world.person(corner).expect("person").direction(), Vec2::X);
    }

    #[test]
    fn travel_suspends_normal_operation() {
        let (mut world, region, communities) = quad_world(quiet_config());
        let traveler = place(&mut world, region, communities[0], Vec2::new(200.0, 200.0));
        let bystander = place(&mut world, region, communities[0], Vec2::new(230.0, 200.0));
        world.persons[traveler].travel_target = Some(communities[2]);

        let start = world.person(traveler).expect("person").position();
        let hub = world.community(communities[2]).expect("community").hub();
        let expected = (hub.center - start).normalize();

        world.step(DT, &off_controls());

        let person = world.person(traveler).expect("person");
        let direction = person.direction();
        assert!(approx(direction.x, expected.x));
        assert!(approx(direction.y, expected.y));
        assert!(world.neighbors_of(traveler).is_empty());
        assert!(world.neighbors_of(bystander).is_empty());
    }

    #[test]
    fn travel_completes_and_switches_community() {
        let (mut world, region, communities) = quad_world(quiet_config());
        let traveler = place(&mut world, region, communities[0], Vec2::new(200.0, 200.0));
        world.persons[traveler].travel_target = Some(communities[2]);

        let controls = off_controls();
        let mut arrivals = 0;
        for _ in 0..2000 {
            arrivals += world.step(0.05, &controls).travel_arrivals;
            if world.person(traveler).expect("person").travel_target().is_none() {
                break;
            }
        }
        assert_eq!(arrivals, 1);
        let person = world.person(traveler).expect("person");
        assert_eq!(person.bounds().community, communities[2]);
        assert!(person.travel_target().is_none());
        let hub = world.community(communities[2]).expect("community").hub();
        assert!(hub.contains(person.position()));
    }

    #[test]
    fn transmission_respects_infection_radius() {
        let config = SimConfig {
            spread_chance: 1.0,
            infection_chance: 1.0,
            event_stagger_secs: 0.0,
            ..quiet_config()
        };
        let (mut world, region, communities) = quad_world(config);
        let source = place(&mut world, region, communities[0], Vec2::new(250.0, 250.0));
        let close = place(&mut world, region, communities[0], Vec2::new(290.0, 250.0));
        let near_miss = place(&mut world, region, communities[0], Vec2::new(340.0, 250.0));
        let far = place(&mut world, region, communities[0], Vec2::new(450.0, 250.0));
        world.persons[source].state = HealthState::Infected;
        world.persons[source].infected_since = Some(0.0);
        world.persons[source].last_event = 0.0;

        let report = world.step(3.0, &off_controls());
        assert_eq!(report.new_infections, 1);
        assert_eq!(
            world.person(close).expect("person").state(),
            HealthState::Infected
        );
        assert_eq!(
            world.person(near_miss).expect("person").state(),
            HealthState::Susceptible
        );
        assert_eq!(
            world.person(far).expect("person").state(),
            HealthState::Susceptible
        );
    }

    #[test]
    fn recovered_neighbors_can_be_reinfected() {
        let config = SimConfig {
            spread_chance: 1.0,
            reinfection_chance: 1.0,
            event_stagger_secs: 0.0,
            ..quiet_config()
        };
        let (mut world, region, communities) = quad_world(config);
        let source = place(&mut world, region, communities[0], Vec2::new(250.0, 250.0));
        let veteran = place(&mut world, region, communities[0], Vec2::new(280.0, 250.0));
        world.persons[source].state = HealthState::Infected;
        world.persons[source].infected_since = Some(0.0);
        world.persons[source].last_event = 0.0;
        world.persons[veteran].state = HealthState::Recovered;

        let report = world.step(3.0, &off_controls());
        assert_eq!(report.new_infections, 1);
        assert_eq!(
            world.person(veteran).expect("person").state(),
            HealthState::Infected
        );
    }

    #[test]
    fn deceased_state_is_absorbing() {
        let config = SimConfig {
            spread_chance: 1.0,
            infection_chance: 1.0,
            reinfection_chance: 1.0,
            event_stagger_secs: 0.0,
            ..quiet_config()
        };
        let (mut world, region, communities) = quad_world(config);
        let source = place(&mut world, region, communities[0], Vec2::new(250.0, 250.0));
        let dead = place(&mut world, region, communities[0], Vec2::new(280.0, 250.0));
        world.persons[source].state = HealthState::Infected;
        world.persons[source].infected_since = Some(0.0);
        world.persons[source].last_event = 0.0;
        world.persons[dead].state = HealthState::Deceased;

        let report = world.step(3.0, &off_controls());
        assert_eq!(report.new_infections, 0);
        assert_eq!(
            world.person(dead).expect("person").state(),
            HealthState::Deceased
        );
    }

    #[test]
    fn double_exposure_infects_once() {
        let config = SimConfig {
            spread_chance: 1.0,
            infection_chance: 1.0,
            event_stagger_secs: 0.0,
            ..quiet_config()
        };
        let (mut world, region, communities) = quad_world(config);
        let left = place(&mut world, region, communities[0], Vec2::new(210.0, 250.0));
        let right = place(&mut world, region, communities[0], Vec2::new(290.0, 250.0));
        let target = place(&mut world, region, communities[0], Vec2::new(250.0, 250.0));
        for key in [left, right] {
            world.persons[key].state = HealthState::Infected;
            world.persons[key].infected_since = Some(0.0);
            world.persons[key].last_event = 0.0;
        }

        let report = world.step(3.0, &off_controls());
        assert_eq!(report.new_infections, 1);
        assert_eq!(
            world.person(target).expect("person").state(),
            HealthState::Infected
        );
        assert!(world.person(target).expect("person").infected_since().is_some());
    }

    #[test]
    fn expiry_resolves_after_max_duration() {
        for (mortality, expected) in [(0.0, HealthState::Recovered), (1.0, HealthState::Deceased)] {
            let config = SimConfig {
                spread_chance: 0.0,
                mortality_chance: mortality,
                ..quiet_config()
            };
            let (mut world, region, communities) = quad_world(config);
            let patient = place(&mut world, region, communities[0], Vec2::new(250.0, 250.0));
            world.persons[patient].state = HealthState::Infected;
            world.persons[patient].infected_since = Some(0.0);
            world.persons[patient].last_event = 0.0;

            let report = world.step(61.0, &off_controls());
            let person = world.person(patient).expect("person");
            assert_eq!(person.state(), expected);
            assert_eq!(person.infected_until(), Some(61.0));
            if expected == HealthState::Deceased {
                assert_eq!(report.new_deaths, 1);
            } else {
                assert_eq!(report.new_recoveries, 1);
            }
        }
    }

    #[test]
    fn zero_distance_pair_keeps_finite_direction() {
        let (mut world, region, communities) = quad_world(quiet_config());
        let a = place(&mut world, region, communities[0], Vec2::new(250.0, 250.0));
        let b = place(&mut world, region, communities[0], Vec2::new(250.0, 250.0));
        world.persons[a].distancing = true;
        world.persons[b].distancing = true;
        let before = world.person(a).expect("person").direction();

        let controls = Controls {
            distancing_enabled: true,
            distancing_strength: 1.0,
            distancing_percent: 0.0,
            ..Controls::default()
        };
        world.step(DT, &controls);

        let after = world.person(a).expect("person").direction();
        assert!(after.is_finite());
        assert!(approx(after.length(), 1.0));
        assert!(approx(after.x, before.x));
        assert!(approx(after.y, before.y));
    }

    #[test]
    fn distancing_force_separates_neighbors() {
        let (mut world, region, communities) = quad_world(quiet_config());
        let a = place(&mut world, region, communities[0], Vec2::new(210.0, 250.0));
        let b = place(&mut world, region, communities[0], Vec2::new(310.0, 250.0));
        world.persons[a].distancing = true;
        world.persons[b].distancing = true;
        let gap_before = world
            .person(a)
            .expect("person")
            .position()
            .distance(world.person(b).expect("person").position());

        let controls = Controls {
            distancing_enabled: true,
            distancing_strength: 3.0,
            distancing_percent: 0.0,
            ..Controls::default()
        };
        world.step(DT, &controls);

        let gap_after = world
            .person(a)
            .expect("person")
            .position()
            .distance(world.person(b).expect("person").position());
        assert!(gap_after > gap_before);
    }

    #[test]
    fn distancing_force_requires_toggle_and_flag() {
        let (mut world, region, communities) = quad_world(quiet_config());
        let a = place(&mut world, region, communities[0], Vec2::new(240.0, 250.0));
        let _b = place(&mut world, region, communities[0], Vec2::new(260.0, 250.0));
        world.persons[a].distancing = true;
        let before = world.person(a).expect("person").direction();

        world.step(DT, &off_controls());
        let after = world.person(a).expect("person").direction();
        assert!(approx(after.x, before.x));
        assert!(approx(after.y, before.y));
    }

    #[test]
    fn effective_bounds_follow_community_toggle() {
        let (mut world, region, communities) = quad_world(quiet_config());
        let key = place(&mut world, region, communities[0], Vec2::new(250.0, 250.0));
        let bounds = world.person(key).expect("person").bounds();

        world.step(DT, &Controls::default());
        assert_eq!(
            world.active_area(bounds),
            ActiveArea::Community(communities[0])
        );
        let community_rect = world.active_rect(bounds);

        let open = Controls {
            communities_enabled: false,
            ..Controls::default()
        };
        world.step(DT, &open);
        assert_eq!(world.active_area(bounds), ActiveArea::Region(region));
        let region_rect = world.active_rect(bounds);
        assert!(region_rect.size.x > community_rect.size.x);
    }
}
