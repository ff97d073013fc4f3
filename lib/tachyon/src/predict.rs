use crate::state::node::NodeType;
use glam::{Quat, Vec3, Vec4};
use quark::time::TICKS_PER_SECOND;

/// Exponential smoothing factor for the trend of the trend filters.
const TREND_SMOOTHING: f32 = 0.9;

/// Rotations smaller than this (radians) collapse to identity when a scaled
/// axis-angle is turned back into a quaternion.
const MIN_AXIS_ANGLE: f32 = 0.01;

/// Per-session prediction tuning. Established once at connection setup and
/// passed explicitly into every decode and sample call.
#[derive(Debug, Copy, Clone)]
pub struct PredictionConstants {
    /// Expected tick spacing between consecutive samples of one value.
    pub frame_tick_length: i64,
    /// Trend correction gain of the double-exponential predictor.
    pub correction: f32,
    /// Value smoothing gain of the double-exponential predictor.
    pub smoothing: f32,
    /// Extra lookahead, in frames, added to every double-exponential sample.
    pub prediction_bias: f32,
    /// Extrapolation clamp: past this many ticks without a sample, the
    /// linear filter pins to the newest value.
    pub lerp_threshold_ticks: i64,
}

impl PredictionConstants {
    pub fn for_frame_rate(frames_per_second: u32) -> PredictionConstants {
        PredictionConstants {
            frame_tick_length: TICKS_PER_SECOND / i64::from(frames_per_second.max(1)),
            correction: 0.75,
            smoothing: 0.25,
            prediction_bias: 0.0,
            lerp_threshold_ticks: TICKS_PER_SECOND,
        }
    }
}

impl Default for PredictionConstants {
    fn default() -> PredictionConstants {
        PredictionConstants::for_frame_rate(20)
    }
}

#[inline]
fn frame_factor(delta_ticks: i64, constants: &PredictionConstants) -> f32 {
    (delta_ticks as f64 / constants.frame_tick_length as f64) as f32
}

// --- linear delta ----------------------------------------------------------

/// Two-sample linear filter. Holds the newest and the previous sample with
/// their receive times; sampling projects the motion between them forward.
#[derive(Debug, Copy, Clone)]
pub struct LinearDelta {
    current: Vec3,
    previous: Vec3,
    t_current: i64,
    t_previous: i64,
}

impl LinearDelta {
    #[inline]
    pub fn new() -> LinearDelta {
        LinearDelta {
            current: Vec3::ZERO,
            previous: Vec3::ZERO,
            t_current: 0,
            t_previous: 0,
        }
    }

    #[inline]
    pub fn reset(&mut self, value: Vec3) {
        self.current = value;
        self.previous = value;
        self.t_current = 0;
        self.t_previous = 0;
    }

    #[inline]
    pub fn receive_new_value(&mut self, value: Vec3, now: i64) {
        self.previous = self.current;
        self.t_previous = self.t_current;
        self.current = value;
        self.t_current = now;
    }

    #[inline]
    pub fn raw_value(&self) -> Vec3 {
        self.current
    }

    #[inline]
    pub fn sample_time(&self) -> i64 {
        self.t_current
    }

    /// Projects the value at `now`. At the instant the newest sample arrived
    /// the result is exactly that sample; past it, the motion between the
    /// two samples continues linearly. Once the newest sample is older than
    /// the threshold, the result pins to it.
    pub fn lerp(&self, now: i64, constants: &PredictionConstants) -> Vec3 {
        if self.t_current <= self.t_previous {
            return self.previous;
        }

        let delta = now - self.t_current;
        let factor = if delta > constants.lerp_threshold_ticks {
            1.0
        } else {
            1.0 + frame_factor(delta, constants)
        };

        self.previous.lerp(self.current, factor)
    }
}

/// Quaternion variant of [`LinearDelta`]; spherical interpolation instead
/// of componentwise.
#[derive(Debug, Copy, Clone)]
pub struct LinearDeltaQuat {
    current: Quat,
    previous: Quat,
    t_current: i64,
    t_previous: i64,
}

impl LinearDeltaQuat {
    #[inline]
    pub fn new() -> LinearDeltaQuat {
        LinearDeltaQuat {
            current: Quat::IDENTITY,
            previous: Quat::IDENTITY,
            t_current: 0,
            t_previous: 0,
        }
    }

    #[inline]
    pub fn reset(&mut self, value: Quat) {
        self.current = value;
        self.previous = value;
        self.t_current = 0;
        self.t_previous = 0;
    }

    #[inline]
    pub fn receive_new_value(&mut self, value: Quat, now: i64) {
        self.previous = self.current;
        self.t_previous = self.t_current;
        self.current = value;
        self.t_current = now;
    }

    #[inline]
    pub fn raw_value(&self) -> Quat {
        self.current
    }

    pub fn slerp(&self, now: i64, constants: &PredictionConstants) -> Quat {
        if self.t_current <= self.t_previous {
            return self.previous;
        }

        let delta = now - self.t_current;
        let factor = if delta > constants.lerp_threshold_ticks {
            1.0
        } else {
            1.0 + frame_factor(delta, constants)
        };

        self.previous.slerp(self.current, factor)
    }
}

// --- exponential trend, vector --------------------------------------------

/// Single-sample-ahead predictor with trend smoothing. The trend absorbs the
/// error between the prediction and each arriving sample, so the output
/// accelerates toward the true value instead of stepping. Not bound to a
/// wire type; a drop-in alternative to [`LinearDelta`] for values the
/// application smooths itself.
#[derive(Debug, Copy, Clone)]
pub struct ExpFilteredVector {
    last_received: Vec3,
    extrapolated: Vec3,
    trend: Vec3,
    t_received: i64,
    t_extrapolated: i64,
}

impl ExpFilteredVector {
    #[inline]
    pub fn new() -> ExpFilteredVector {
        ExpFilteredVector {
            last_received: Vec3::ZERO,
            extrapolated: Vec3::ZERO,
            trend: Vec3::ZERO,
            t_received: 0,
            t_extrapolated: 0,
        }
    }

    #[inline]
    pub fn reset(&mut self, value: Vec3) {
        self.last_received = value;
        self.extrapolated = value;
        self.trend = Vec3::ZERO;
        self.t_received = 0;
        self.t_extrapolated = 0;
    }

    #[inline]
    pub fn raw_value(&self) -> Vec3 {
        self.last_received
    }

    #[inline]
    pub fn sample_time(&self) -> i64 {
        self.t_received
    }

    pub fn receive_new_value(&mut self, value: Vec3, now: i64, constants: &PredictionConstants) {
        // Advance the extrapolation to the arrival time first, so the error
        // term measures against what the consumer actually saw.
        if self.t_extrapolated != 0 && now > self.t_extrapolated {
            self.sample(now, constants);
        }

        let error = value - self.extrapolated;
        let raw_trend = value - self.last_received;

        self.last_received = value;
        self.t_received = now;
        if self.t_extrapolated == 0 {
            self.t_extrapolated = now;
        }

        self.trend = self.trend.lerp(raw_trend, TREND_SMOOTHING) + error;
    }

    /// Advances the extrapolated value to `now` and returns it.
    pub fn sample(&mut self, now: i64, constants: &PredictionConstants) -> Vec3 {
        if self.t_extrapolated > 0 {
            let factor = frame_factor(now - self.t_extrapolated, constants);
            self.extrapolated += self.trend * factor;
            self.t_extrapolated = now;
        }
        self.extrapolated
    }
}

// --- exponential trend, quaternion ----------------------------------------

/// [`ExpFilteredVector`] composed in rotation space: trend and error are
/// relative rotations, stored additionally as axis-angle so extrapolation
/// can scale the angle. Like its vector twin, application-driven rather
/// than wire-bound.
#[derive(Debug, Copy, Clone)]
pub struct ExpFilteredQuaternion {
    last_received: Quat,
    extrapolated: Quat,
    trend: Quat,
    trend_axis_angle: Vec4,
    error_axis_angle: Vec4,
    t_received: i64,
    t_extrapolated: i64,
}

impl ExpFilteredQuaternion {
    #[inline]
    pub fn new() -> ExpFilteredQuaternion {
        let mut filter = ExpFilteredQuaternion {
            last_received: Quat::IDENTITY,
            extrapolated: Quat::IDENTITY,
            trend: Quat::IDENTITY,
            trend_axis_angle: Vec4::new(0.0, 1.0, 0.0, 0.0),
            error_axis_angle: Vec4::new(0.0, 1.0, 0.0, 0.0),
            t_received: 0,
            t_extrapolated: 0,
        };
        filter.reset(Quat::IDENTITY);
        filter
    }

    pub fn reset(&mut self, value: Quat) {
        self.last_received = value;
        self.extrapolated = value;
        self.trend = Quat::IDENTITY;
        self.trend_axis_angle = Vec4::new(0.0, 1.0, 0.0, 0.0);
        self.error_axis_angle = Vec4::new(0.0, 1.0, 0.0, 0.0);
        self.t_received = 0;
        self.t_extrapolated = 0;
    }

    #[inline]
    pub fn raw_value(&self) -> Quat {
        self.last_received
    }

    #[inline]
    pub fn sample_time(&self) -> i64 {
        self.t_received
    }

    /// The rotation taking `a` to `b`.
    #[inline]
    fn rotation_between(a: Quat, b: Quat) -> Quat {
        b * a.inverse()
    }

    #[inline]
    fn to_axis_angle(q: Quat) -> Vec4 {
        let (axis, angle) = q.to_axis_angle();
        axis.extend(angle)
    }

    #[inline]
    fn from_scaled_axis_angle(axis_angle: Vec4, factor: f32) -> Quat {
        let angle = axis_angle.w * factor;
        if angle.abs() >= MIN_AXIS_ANGLE {
            Quat::from_axis_angle(axis_angle.truncate().normalize(), angle)
        } else {
            Quat::IDENTITY
        }
    }

    pub fn receive_new_value(&mut self, value: Quat, now: i64) {
        let error = Self::rotation_between(self.extrapolated, value);
        let raw_trend = Self::rotation_between(self.last_received, value);

        self.last_received = value;
        self.t_received = now;

        if self.t_extrapolated == 0 {
            self.reset(value);
            self.t_received = now;
            self.t_extrapolated = now;
        } else {
            let trend = self.trend.slerp(raw_trend, TREND_SMOOTHING);
            self.trend = trend;
            self.trend_axis_angle = Self::to_axis_angle(trend);
            self.error_axis_angle = Self::to_axis_angle(error);
        }
    }

    /// Advances the extrapolated orientation to `now` and returns it. The
    /// stored error and trend rotations are applied scaled by the elapsed
    /// fraction of a frame.
    pub fn sample(&mut self, now: i64, constants: &PredictionConstants) -> Quat {
        if self.t_extrapolated > 0 {
            let factor = frame_factor(now - self.t_extrapolated, constants);
            let error = Self::from_scaled_axis_angle(self.error_axis_angle, factor);
            let trend = Self::from_scaled_axis_angle(self.trend_axis_angle, factor);

            self.extrapolated = (trend * error * self.extrapolated).normalize();
            self.t_extrapolated = now;
        }
        self.extrapolated
    }
}

// --- double exponential ----------------------------------------------------

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PredictionState {
    Zero,
    StaticValue,
    MovingValue,
}

/// Value space the double-exponential predictor operates in. Trend
/// arithmetic is componentwise even for quaternions; only the value mixing
/// and renormalization differ.
pub trait PredictSpace: Copy {
    fn zero_value() -> Self;
    fn zero_trend() -> Self;
    fn add(self, other: Self) -> Self;
    fn sub(self, other: Self) -> Self;
    fn scale(self, factor: f32) -> Self;
    /// Componentwise lerp; used for trend blending.
    fn lerp_components(a: Self, b: Self, t: f32) -> Self;
    /// Value-space interpolation: lerp for vectors, slerp for quaternions.
    fn mix(a: Self, b: Self, t: f32) -> Self;
    fn renormalize(self) -> Self;
}

impl PredictSpace for Vec3 {
    #[inline]
    fn zero_value() -> Vec3 {
        Vec3::ZERO
    }
    #[inline]
    fn zero_trend() -> Vec3 {
        Vec3::ZERO
    }
    #[inline]
    fn add(self, other: Vec3) -> Vec3 {
        self + other
    }
    #[inline]
    fn sub(self, other: Vec3) -> Vec3 {
        self - other
    }
    #[inline]
    fn scale(self, factor: f32) -> Vec3 {
        self * factor
    }
    #[inline]
    fn lerp_components(a: Vec3, b: Vec3, t: f32) -> Vec3 {
        a.lerp(b, t)
    }
    #[inline]
    fn mix(a: Vec3, b: Vec3, t: f32) -> Vec3 {
        a.lerp(b, t)
    }
    #[inline]
    fn renormalize(self) -> Vec3 {
        self
    }
}

impl PredictSpace for Quat {
    #[inline]
    fn zero_value() -> Quat {
        Quat::IDENTITY
    }
    #[inline]
    fn zero_trend() -> Quat {
        Quat::from_xyzw(0.0, 0.0, 0.0, 0.0)
    }
    #[inline]
    fn add(self, other: Quat) -> Quat {
        Quat::from_vec4(Vec4::from(self) + Vec4::from(other))
    }
    #[inline]
    fn sub(self, other: Quat) -> Quat {
        Quat::from_vec4(Vec4::from(self) - Vec4::from(other))
    }
    #[inline]
    fn scale(self, factor: f32) -> Quat {
        Quat::from_vec4(Vec4::from(self) * factor)
    }
    #[inline]
    fn lerp_components(a: Quat, b: Quat, t: f32) -> Quat {
        Quat::from_vec4(Vec4::from(a).lerp(Vec4::from(b), t))
    }
    #[inline]
    fn mix(a: Quat, b: Quat, t: f32) -> Quat {
        a.slerp(b, t)
    }
    #[inline]
    fn renormalize(self) -> Quat {
        self.normalize()
    }
}

/// Double-exponential predictor. Values move through three states: the
/// first sample is held static, the second starts trend tracking, and
/// subsequent samples are smoothed against the projected value.
#[derive(Debug, Copy, Clone)]
pub struct DoubleExp<T: PredictSpace> {
    filtered: T,
    trend: T,
    raw: T,
    state: PredictionState,
    last_timestamp: i64,
}

impl<T: PredictSpace> DoubleExp<T> {
    #[inline]
    pub fn new() -> DoubleExp<T> {
        DoubleExp {
            filtered: T::zero_value(),
            trend: T::zero_trend(),
            raw: T::zero_value(),
            state: PredictionState::Zero,
            last_timestamp: 0,
        }
    }

    /// Pins the predictor to a fixed value without starting trend tracking.
    pub fn update_static(&mut self, value: T) {
        self.filtered = value;
        self.raw = value;
        self.trend = T::zero_trend();
        self.state = PredictionState::StaticValue;
    }

    pub fn static_value(&self) -> T {
        debug_assert!(self.state != PredictionState::MovingValue);
        self.filtered
    }

    #[inline]
    pub fn raw_value(&self) -> T {
        self.raw
    }

    pub fn update_from_network(&mut self, raw: T, now: i64, constants: &PredictionConstants) {
        if self.state == PredictionState::Zero {
            self.update_static(raw);
            self.last_timestamp = now;
            return;
        }

        let prev_filtered = self.filtered;
        let prev_trend = self.trend;
        let prev_raw = self.raw;

        let filtered = match self.state {
            PredictionState::StaticValue => {
                self.state = PredictionState::MovingValue;
                prev_raw.add(raw).scale(0.5).renormalize()
            }
            PredictionState::MovingValue => T::mix(
                raw,
                prev_filtered.add(prev_trend).renormalize(),
                constants.smoothing,
            ),
            PredictionState::Zero => unreachable!(),
        };

        let diff = filtered.sub(prev_filtered);
        self.trend = T::lerp_components(prev_trend, diff, constants.correction);
        self.filtered = filtered;
        self.raw = raw;
        self.last_timestamp = now;
    }

    /// Projects the value at `now`. If a full frame has elapsed with no new
    /// sample, a synthetic update from the last raw value is injected and
    /// the trend halved, damping runaway extrapolation.
    pub fn predicted_value(&mut self, now: i64, constants: &PredictionConstants) -> T {
        if self.state != PredictionState::MovingValue {
            return self.filtered;
        }

        let mut delta = now - self.last_timestamp;

        if delta >= constants.frame_tick_length {
            let synth = self.last_timestamp + constants.frame_tick_length;
            self.update_from_network(self.raw, synth, constants);
            self.trend = self.trend.scale(0.5);
            delta = now - self.last_timestamp;
        }

        let lookahead = (delta as f64 / constants.frame_tick_length as f64) as f32
            + constants.prediction_bias;

        self.filtered.add(self.trend.scale(lookahead)).renormalize()
    }
}

pub type PredictionVector3 = DoubleExp<Vec3>;
pub type PredictionQuaternion = DoubleExp<Quat>;

// --- node-type dispatch ----------------------------------------------------

/// Per-node filter state, selected by the node's type at creation. Every
/// three-component delta wire type shares the one linear vector filter;
/// the quaternion delta type gets its slerp twin.
#[derive(Debug, Clone)]
pub enum Filter {
    Linear(LinearDelta),
    LinearQuat(LinearDeltaQuat),
    PredictVector(PredictionVector3),
    PredictQuaternion(PredictionQuaternion),
}

impl Filter {
    pub fn for_node_type(node_type: NodeType) -> Option<Filter> {
        match node_type {
            NodeType::Float3Delta
            | NodeType::Float3AsHalf4Delta
            | NodeType::Float3AsQwordDelta => Some(Filter::Linear(LinearDelta::new())),
            NodeType::Float4AsHalf4Delta => Some(Filter::LinearQuat(LinearDeltaQuat::new())),
            NodeType::PredictFloat3 => Some(Filter::PredictVector(DoubleExp::new())),
            NodeType::PredictQuaternion => Some(Filter::PredictQuaternion(DoubleExp::new())),
            _ => None,
        }
    }

    /// Feeds a decoded three-component sample into the filter.
    pub fn receive_vec3(&mut self, value: Vec3, now: i64, constants: &PredictionConstants) {
        match self {
            Filter::Linear(f) => f.receive_new_value(value, now),
            Filter::PredictVector(f) => f.update_from_network(value, now, constants),
            _ => debug_assert!(false, "vec3 sample fed to a quaternion filter"),
        }
    }

    /// Feeds a decoded quaternion sample into the filter.
    pub fn receive_quat(&mut self, value: Quat, now: i64, constants: &PredictionConstants) {
        match self {
            Filter::LinearQuat(f) => f.receive_new_value(value, now),
            Filter::PredictQuaternion(f) => f.update_from_network(value, now, constants),
            _ => debug_assert!(false, "quaternion sample fed to a vector filter"),
        }
    }

    /// Most recent raw sample, three-component filters.
    pub fn raw_vec3(&self) -> Option<Vec3> {
        match self {
            Filter::Linear(f) => Some(f.raw_value()),
            Filter::PredictVector(f) => Some(f.raw_value()),
            _ => None,
        }
    }

    /// Most recent raw sample, quaternion filters.
    pub fn raw_quat(&self) -> Option<Quat> {
        match self {
            Filter::LinearQuat(f) => Some(f.raw_value()),
            Filter::PredictQuaternion(f) => Some(f.raw_value()),
            _ => None,
        }
    }

    /// Smoothed/predicted value at `now`, three-component filters.
    pub fn sample_vec3(&mut self, now: i64, constants: &PredictionConstants) -> Option<Vec3> {
        match self {
            Filter::Linear(f) => Some(f.lerp(now, constants)),
            Filter::PredictVector(f) => Some(f.predicted_value(now, constants)),
            _ => None,
        }
    }

    /// Smoothed/predicted value at `now`, quaternion filters.
    pub fn sample_quat(&mut self, now: i64, constants: &PredictionConstants) -> Option<Quat> {
        match self {
            Filter::LinearQuat(f) => Some(f.slerp(now, constants)),
            Filter::PredictQuaternion(f) => Some(f.predicted_value(now, constants)),
            _ => None,
        }
    }
}
