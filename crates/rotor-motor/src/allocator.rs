use crate::topology::{Axis, MotorTopology};
use glam::DVec3;
use std::ops::Index;
use thiserror::Error;

/// Slack on the unit bounds so that a normalised vector is not rejected
/// over rounding.
const BOUND_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AllocationError {
    #[error("linear motion magnitude {magnitude} exceeds 1")]
    LinearTooLarge { magnitude: f64 },
    #[error("angular motion magnitude {magnitude} exceeds 1")]
    AngularTooLarge { magnitude: f64 },
    #[error("no motors can push along {direction}{axis}")]
    UnsupportedDirection { axis: Axis, direction: char },
    #[error("motion command contains a non-finite component")]
    NonFinite,
}

/// Per-motor thrust fractions, each in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MotorThrust(Vec<f64>);

impl MotorThrust {
    pub fn zeros(motor_count: usize) -> Self {
        Self(vec![0.0; motor_count])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.0.iter().copied()
    }
}

impl Index<usize> for MotorThrust {
    type Output = f64;

    fn index(&self, motor: usize) -> &f64 {
        &self.0[motor]
    }
}

/// Maps a linear motion vector and a yaw rate onto per-motor thrust.
///
/// Each axis contributes its squared component to the motors on that axis
/// and sign, so a vector with `|v| <= 1` never pushes one motor past 1 before
/// yaw is applied. Yaw then shifts squared thrust from the opposing spin pair
/// to the desired one, bounded by the most constrained motor on each side.
/// The square root of every accumulated sum is the final fraction.
///
/// Rejected inputs produce no output at all; callers keep whatever they sent
/// to the motors last.
pub fn allocate(
    linear: DVec3,
    yaw_rate: f64,
    topology: &MotorTopology,
) -> Result<MotorThrust, AllocationError> {
    if !linear.is_finite() || !yaw_rate.is_finite() {
        return Err(AllocationError::NonFinite);
    }
    let magnitude = linear.length();
    if magnitude > 1.0 + BOUND_TOLERANCE {
        return Err(AllocationError::LinearTooLarge { magnitude });
    }
    if yaw_rate.abs() > 1.0 + BOUND_TOLERANCE {
        return Err(AllocationError::AngularTooLarge {
            magnitude: yaw_rate.abs(),
        });
    }

    let mut squares = vec![0.0; topology.motor_count()];

    for (axis, component) in Axis::ALL.into_iter().zip(linear.to_array()) {
        if component == 0.0 {
            continue;
        }
        let motors = topology.axis(axis).for_sign(component);
        if motors.is_empty() {
            let direction = if component < 0.0 { '-' } else { '+' };
            return Err(AllocationError::UnsupportedDirection { axis, direction });
        }
        let square = component * component;
        for &motor in motors {
            squares[motor] += square;
        }
    }

    if yaw_rate != 0.0 {
        let spin = topology.spin();
        let (desired, opposing) = if yaw_rate < 0.0 {
            (&spin.negative, &spin.positive)
        } else {
            (&spin.positive, &spin.negative)
        };

        let max_increase = desired
            .iter()
            .map(|&m| 1.0 - squares[m])
            .fold(1.0_f64, f64::min)
            .max(0.0);
        let max_decrease = opposing
            .iter()
            .map(|&m| squares[m])
            .fold(1.0_f64, f64::min)
            .max(0.0);

        let yaw_square = yaw_rate * yaw_rate;
        for &m in desired {
            squares[m] += max_increase * yaw_square;
        }
        for &m in opposing {
            squares[m] -= max_decrease * yaw_square;
        }
    }

    Ok(MotorThrust(
        squares
            .into_iter()
            .map(|sum| sum.max(0.0).sqrt().clamp(0.0, 1.0))
            .collect(),
    ))
}
