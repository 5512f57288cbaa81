use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("topology has no motors")]
    NoMotors,
    #[error("motor index {index} out of range for {motor_count} motors")]
    IndexOutOfRange { index: usize, motor_count: usize },
    #[error("both spin directions need at least one motor")]
    EmptySpinPair,
}

/// Motors driven when an axis component is positive or negative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AxisMotors {
    pub positive: Vec<usize>,
    pub negative: Vec<usize>,
}

impl AxisMotors {
    pub fn new(positive: &[usize], negative: &[usize]) -> Self {
        Self {
            positive: positive.to_vec(),
            negative: negative.to_vec(),
        }
    }

    /// The subset for the sign of `component`. Zero counts as positive.
    pub fn for_sign(&self, component: f64) -> &[usize] {
        if component < 0.0 {
            &self.negative
        } else {
            &self.positive
        }
    }
}

/// Which motors produce thrust along each body axis and spin about Z.
///
/// Assumes a symmetric X or + frame where each axis direction maps to its
/// own subset of motors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotorTopology {
    motor_count: usize,
    x: AxisMotors,
    y: AxisMotors,
    z: AxisMotors,
    /// `positive` spins the frame counter-clockwise seen from above.
    spin: AxisMotors,
}

impl MotorTopology {
    pub fn new(
        motor_count: usize,
        x: AxisMotors,
        y: AxisMotors,
        z: AxisMotors,
        spin: AxisMotors,
    ) -> Result<Self, TopologyError> {
        if motor_count == 0 {
            return Err(TopologyError::NoMotors);
        }
        if spin.positive.is_empty() || spin.negative.is_empty() {
            return Err(TopologyError::EmptySpinPair);
        }

        for set in [&x, &y, &z, &spin] {
            for &index in set.positive.iter().chain(&set.negative) {
                if index >= motor_count {
                    return Err(TopologyError::IndexOutOfRange { index, motor_count });
                }
            }
        }

        Ok(Self {
            motor_count,
            x,
            y,
            z,
            spin,
        })
    }

    /// Four motors, no reverse thrust:
    ///
    /// ```text
    ///        +X
    ///        2
    ///  +Y 3     1 -Y
    ///        0
    /// ```
    ///
    /// Motors 1 and 3 spin the frame towards +Z, 0 and 2 towards -Z.
    pub fn reference_quad() -> Self {
        Self {
            motor_count: 4,
            x: AxisMotors::new(&[2], &[0]),
            y: AxisMotors::new(&[3], &[1]),
            z: AxisMotors::new(&[0, 1, 2, 3], &[]),
            spin: AxisMotors::new(&[1, 3], &[0, 2]),
        }
    }

    pub fn motor_count(&self) -> usize {
        self.motor_count
    }

    pub fn axis(&self, axis: Axis) -> &AxisMotors {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }

    pub fn spin(&self) -> &AxisMotors {
        &self.spin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_quad_is_valid() {
        let quad = MotorTopology::reference_quad();
        let rebuilt = MotorTopology::new(
            4,
            quad.axis(Axis::X).clone(),
            quad.axis(Axis::Y).clone(),
            quad.axis(Axis::Z).clone(),
            quad.spin().clone(),
        )
        .unwrap();
        assert_eq!(rebuilt, quad);
        assert!(quad.axis(Axis::Z).negative.is_empty());
        assert_eq!(quad.axis(Axis::X).for_sign(-0.5), &[0]);
        assert_eq!(quad.axis(Axis::X).for_sign(0.0), &[2]);
    }

    #[test]
    fn rejects_bad_layouts() {
        let spin = AxisMotors::new(&[0], &[1]);
        assert_eq!(
            MotorTopology::new(
                0,
                AxisMotors::default(),
                AxisMotors::default(),
                AxisMotors::default(),
                spin.clone(),
            ),
            Err(TopologyError::NoMotors)
        );
        assert_eq!(
            MotorTopology::new(
                2,
                AxisMotors::new(&[5], &[]),
                AxisMotors::default(),
                AxisMotors::default(),
                spin
            ),
            Err(TopologyError::IndexOutOfRange {
                index: 5,
                motor_count: 2
            })
        );
        assert_eq!(
            MotorTopology::new(
                2,
                AxisMotors::default(),
                AxisMotors::default(),
                AxisMotors::new(&[0, 1], &[]),
                AxisMotors::new(&[0], &[])
            ),
            Err(TopologyError::EmptySpinPair)
        );
    }
}
