//! # Calibration Model
//!
//! Converts (pressure, known weight) samples into a linear weight model:
//!
//! ```text
//! weight = intercept
//!        + air_pressure_coeff     * air_pressure
//!        + ambient_pressure_coeff * ambient_pressure
//!        + air_temp_coeff         * air_temp
//! ```
//!
//! Air pressure is always a regressor. Ambient pressure and air temperature
//! join the fit only when every usable point carries them, they vary across
//! the points, and adding them keeps the normal equations solvable. Otherwise
//! their coefficient is 0 and the fit is pressure-only.

use crate::error::CalibrationError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Pivot threshold for the standardized normal matrix (diagonal is 1)
const PIVOT_EPSILON: f64 = 1e-10;

/// One calibration sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub air_pressure: f64,
    pub weight: f64,
    #[serde(default)]
    pub ambient_pressure: Option<f64>,
    #[serde(default)]
    pub air_temp: Option<f64>,
}

impl CalibrationPoint {
    pub fn new(air_pressure: f64, weight: f64) -> Self {
        Self {
            air_pressure,
            weight,
            ambient_pressure: None,
            air_temp: None,
        }
    }

    pub fn with_ambient_pressure(mut self, ambient_pressure: f64) -> Self {
        self.ambient_pressure = Some(ambient_pressure);
        self
    }

    pub fn with_air_temp(mut self, air_temp: f64) -> Self {
        self.air_temp = Some(air_temp);
        self
    }

    fn is_usable(&self) -> bool {
        self.air_pressure.is_finite() && self.weight.is_finite()
    }
}

/// Parses `pressure,weight[,ambient[,temp]]`. An empty field skips that reading,
/// so `30,500,,21.5` has a temperature but no ambient pressure.
impl FromStr for CalibrationPoint {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CalibrationError::InvalidPoint(s.to_string());
        let fields: Vec<&str> = s.split(',').map(str::trim).collect();
        if !(2..=4).contains(&fields.len()) {
            return Err(invalid());
        }

        let optional = |index: usize| -> Result<Option<f64>, CalibrationError> {
            match fields.get(index) {
                None | Some(&"") => Ok(None),
                Some(field) => field.parse().map(Some).map_err(|_| invalid()),
            }
        };
        let air_pressure = fields[0].parse().map_err(|_| invalid())?;
        let weight = fields[1].parse().map_err(|_| invalid())?;

        let mut point = Self::new(air_pressure, weight);
        if let Some(ambient_pressure) = optional(2)? {
            point = point.with_ambient_pressure(ambient_pressure);
        }
        if let Some(air_temp) = optional(3)? {
            point = point.with_air_temp(air_temp);
        }
        Ok(point)
    }
}

/// Fitted model as stored with a calibration.
///
/// Optional coefficients are `None` when the points never carried that
/// reading, and `Some(0.0)` when they did but it could not be fitted.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub air_pressure_coeff: f64,
    #[serde(default)]
    pub ambient_pressure_coeff: Option<f64>,
    #[serde(default)]
    pub air_temp_coeff: Option<f64>,
}

/// Wire/storage form pushed to hardware over the coefficients characteristic.
///
/// `target_mac` selects the physical sensor the coefficients apply to;
/// an empty string means the hub itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CoefficientSet {
    #[serde(default)]
    pub intercept: f64,
    #[serde(default)]
    pub air_pressure_coeff: f64,
    #[serde(default)]
    pub ambient_pressure_coeff: f64,
    #[serde(default)]
    pub air_temp_coeff: f64,
    #[serde(default)]
    pub target_mac: String,
}

impl CoefficientSet {
    /// Weight estimate for a reading. Missing environmental readings count as 0.
    pub fn predict(&self, air_pressure: f64, ambient_pressure: Option<f64>, air_temp: Option<f64>) -> f64 {
        self.intercept
            + self.air_pressure_coeff * air_pressure
            + self.ambient_pressure_coeff * ambient_pressure.unwrap_or(0.0)
            + self.air_temp_coeff * air_temp.unwrap_or(0.0)
    }

    /// UTF-8 JSON payload for the coefficients characteristic
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

pub fn to_coefficient_set(model: &LinearModel, target_mac: impl Into<String>) -> CoefficientSet {
    CoefficientSet {
        intercept: model.intercept,
        air_pressure_coeff: model.air_pressure_coeff,
        ambient_pressure_coeff: model.ambient_pressure_coeff.unwrap_or(0.0),
        air_temp_coeff: model.air_temp_coeff.unwrap_or(0.0),
        target_mac: target_mac.into(),
    }
}

/// Fits `points` and maps the result straight to the wire form.
pub fn fit_coefficients(
    points: &[CalibrationPoint],
    target_mac: impl Into<String>,
) -> Result<CoefficientSet, CalibrationError> {
    fit(points).map(|model| to_coefficient_set(&model, target_mac))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Term {
    AirPressure,
    AmbientPressure,
    AirTemp,
}

/// A standardized regressor column: `z = (x - mean) / scale`
#[derive(Debug, Clone)]
struct Regressor {
    term: Term,
    z: Vec<f64>,
    mean: f64,
    scale: f64,
}

impl Regressor {
    /// Returns `None` when the column has no variance.
    fn standardize(term: Term, values: Vec<f64>) -> Option<Self> {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        let scale = var.sqrt();
        let floor = f64::EPSILON * 16.0 * mean.abs().max(1.0);
        if !scale.is_finite() || scale <= floor {
            return None;
        }
        let z = values.iter().map(|v| (v - mean) / scale).collect();
        Some(Self { term, z, mean, scale })
    }
}

/// Least-squares fit of weight against pressure and, when usable, the
/// environmental readings.
pub fn fit(points: &[CalibrationPoint]) -> Result<LinearModel, CalibrationError> {
    let usable: Vec<&CalibrationPoint> = points.iter().filter(|p| p.is_usable()).collect();
    if usable.len() < 2 {
        return Err(CalibrationError::InsufficientData {
            usable: usable.len(),
            reason: "at least two points are required",
        });
    }

    let n = usable.len() as f64;
    let mean_weight = usable.iter().map(|p| p.weight).sum::<f64>() / n;
    let centered_weight: Vec<f64> = usable.iter().map(|p| p.weight - mean_weight).collect();

    let pressure = Regressor::standardize(
        Term::AirPressure,
        usable.iter().map(|p| p.air_pressure).collect(),
    )
    .ok_or(CalibrationError::InsufficientData {
        usable: usable.len(),
        reason: "all points share the same pressure",
    })?;

    let mut chosen = vec![pressure];
    let mut model = LinearModel::default();

    // Optional columns count only when every usable point carries the reading
    let ambient = column(&usable, |p| p.ambient_pressure);
    let temp = column(&usable, |p| p.air_temp);
    if ambient.is_some() {
        model.ambient_pressure_coeff = Some(0.0);
    }
    if temp.is_some() {
        model.air_temp_coeff = Some(0.0);
    }

    for (term, values) in [(Term::AmbientPressure, ambient), (Term::AirTemp, temp)] {
        let Some(regressor) = values.and_then(|v| Regressor::standardize(term, v)) else {
            continue;
        };
        let mut trial = chosen.clone();
        trial.push(regressor);
        if solve_normal_equations(&trial, &centered_weight).is_some() {
            chosen = trial;
        } else {
            log::debug!("dropping {:?} from calibration fit: collinear with other regressors", term);
        }
    }

    let beta = solve_normal_equations(&chosen, &centered_weight).ok_or(
        CalibrationError::InsufficientData {
            usable: usable.len(),
            reason: "normal equations are singular",
        },
    )?;

    let mut intercept = mean_weight;
    for (regressor, b) in chosen.iter().zip(beta) {
        let coeff = b / regressor.scale;
        intercept -= coeff * regressor.mean;
        match regressor.term {
            Term::AirPressure => model.air_pressure_coeff = coeff,
            Term::AmbientPressure => model.ambient_pressure_coeff = Some(coeff),
            Term::AirTemp => model.air_temp_coeff = Some(coeff),
        }
    }
    model.intercept = intercept;

    Ok(model)
}

fn column<F>(points: &[&CalibrationPoint], get: F) -> Option<Vec<f64>>
where
    F: Fn(&CalibrationPoint) -> Option<f64>,
{
    points
        .iter()
        .map(|p| get(p).filter(|v| v.is_finite()))
        .collect()
}

/// Solves `(ZᵀZ/n) β = Zᵀy/n` by Gaussian elimination with partial pivoting.
/// Returns `None` if the system is singular.
fn solve_normal_equations(regressors: &[Regressor], y: &[f64]) -> Option<Vec<f64>> {
    let k = regressors.len();
    let n = y.len() as f64;

    // Augmented matrix [A | b]
    let mut m = vec![vec![0.0f64; k + 1]; k];
    for i in 0..k {
        for j in 0..k {
            m[i][j] = dot(&regressors[i].z, &regressors[j].z) / n;
        }
        m[i][k] = dot(&regressors[i].z, y) / n;
    }

    for col in 0..k {
        let pivot_row = (col..k).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot_row][col].abs() < PIVOT_EPSILON {
            return None;
        }
        m.swap(col, pivot_row);
        for row in (col + 1)..k {
            let factor = m[row][col] / m[col][col];
            for c in col..=k {
                m[row][c] -= factor * m[col][c];
            }
        }
    }

    let mut beta = vec![0.0f64; k];
    for row in (0..k).rev() {
        let tail: f64 = ((row + 1)..k).map(|c| m[row][c] * beta[c]).sum();
        beta[row] = (m[row][k] - tail) / m[row][row];
    }
    if beta.iter().all(|b| b.is_finite()) {
        Some(beta)
    } else {
        None
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-6;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < TOL,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_parse_point() {
        assert_eq!("10,0".parse::<CalibrationPoint>(), Ok(CalibrationPoint::new(10.0, 0.0)));
        assert_eq!(
            " 30, 500, , 21.5".parse::<CalibrationPoint>(),
            Ok(CalibrationPoint::new(30.0, 500.0).with_air_temp(21.5))
        );
        assert_eq!(
            "30,500,14.7".parse::<CalibrationPoint>(),
            Ok(CalibrationPoint::new(30.0, 500.0).with_ambient_pressure(14.7))
        );
        assert!(matches!(
            "30".parse::<CalibrationPoint>(),
            Err(CalibrationError::InvalidPoint(_))
        ));
        assert!("30,heavy".parse::<CalibrationPoint>().is_err());
        assert!("1,2,3,4,5".parse::<CalibrationPoint>().is_err());
    }

    #[test]
    fn test_two_point_fit() {
        let points = [CalibrationPoint::new(10.0, 0.0), CalibrationPoint::new(50.0, 1000.0)];
        let set = fit_coefficients(&points, "").unwrap();
        assert_close(set.air_pressure_coeff, 25.0);
        assert_close(set.intercept, -250.0);
        assert_eq!(set.ambient_pressure_coeff, 0.0);
        assert_eq!(set.air_temp_coeff, 0.0);
        assert_close(set.predict(30.0, None, None), 500.0);
    }

    #[test]
    fn test_fewer_than_two_points_is_insufficient() {
        assert!(matches!(
            fit(&[]),
            Err(CalibrationError::InsufficientData { usable: 0, .. })
        ));
        assert!(matches!(
            fit(&[CalibrationPoint::new(10.0, 0.0)]),
            Err(CalibrationError::InsufficientData { usable: 1, .. })
        ));
    }

    #[test]
    fn test_identical_pressure_is_insufficient() {
        let points = [
            CalibrationPoint::new(30.0, 0.0),
            CalibrationPoint::new(30.0, 500.0),
            CalibrationPoint::new(30.0, 900.0),
        ];
        assert!(matches!(fit(&points), Err(CalibrationError::InsufficientData { .. })));
    }

    #[test]
    fn test_non_finite_points_are_not_usable() {
        let points = [CalibrationPoint::new(10.0, 0.0), CalibrationPoint::new(f64::NAN, 1000.0)];
        assert!(matches!(
            fit(&points),
            Err(CalibrationError::InsufficientData { usable: 1, .. })
        ));
    }

    #[test]
    fn test_constant_ambient_resolves_to_zero() {
        let points = [
            CalibrationPoint::new(10.0, 0.0).with_ambient_pressure(14.7),
            CalibrationPoint::new(30.0, 500.0).with_ambient_pressure(14.7),
            CalibrationPoint::new(50.0, 1000.0).with_ambient_pressure(14.7),
        ];
        let model = fit(&points).unwrap();
        assert_eq!(model.ambient_pressure_coeff, Some(0.0));
        assert_eq!(model.air_temp_coeff, None);
        assert_close(model.air_pressure_coeff, 25.0);
    }

    #[test]
    fn test_collinear_regressor_is_dropped() {
        // Two points: any varying ambient column is collinear with pressure
        let points = [
            CalibrationPoint::new(10.0, 0.0).with_ambient_pressure(14.0),
            CalibrationPoint::new(50.0, 1000.0).with_ambient_pressure(15.0),
        ];
        let model = fit(&points).unwrap();
        assert_eq!(model.ambient_pressure_coeff, Some(0.0));
        assert_close(model.air_pressure_coeff, 25.0);
        assert_close(model.intercept, -250.0);
    }

    #[test]
    fn test_partial_environmental_readings_are_ignored() {
        let points = [
            CalibrationPoint::new(10.0, 0.0).with_air_temp(20.0),
            CalibrationPoint::new(30.0, 500.0),
            CalibrationPoint::new(50.0, 1000.0).with_air_temp(25.0),
        ];
        let model = fit(&points).unwrap();
        assert_eq!(model.air_temp_coeff, None);
        assert_close(model.air_pressure_coeff, 25.0);
    }

    #[test]
    fn test_multivariable_fit_recovers_exact_model() {
        let truth = |p: f64, a: f64, t: f64| 5.0 + 20.0 * p + 3.0 * a - 2.0 * t;
        let samples = [
            (10.0, 100.0, 20.0),
            (20.0, 101.0, 25.0),
            (30.0, 99.0, 22.0),
            (40.0, 102.0, 30.0),
            (50.0, 100.0, 18.0),
        ];
        let points: Vec<CalibrationPoint> = samples
            .iter()
            .map(|&(p, a, t)| {
                CalibrationPoint::new(p, truth(p, a, t))
                    .with_ambient_pressure(a)
                    .with_air_temp(t)
            })
            .collect();

        let model = fit(&points).unwrap();
        assert_close(model.air_pressure_coeff, 20.0);
        assert_close(model.ambient_pressure_coeff.unwrap(), 3.0);
        assert_close(model.air_temp_coeff.unwrap(), -2.0);
        assert!((model.intercept - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let points = [
            CalibrationPoint::new(12.5, 40.0).with_air_temp(18.0),
            CalibrationPoint::new(33.1, 610.0).with_air_temp(21.5),
            CalibrationPoint::new(47.9, 1190.0).with_air_temp(19.0),
            CalibrationPoint::new(61.0, 1500.0).with_air_temp(24.0),
        ];
        assert_eq!(fit(&points).unwrap(), fit(&points).unwrap());
    }

    #[test]
    fn test_to_coefficient_set_defaults_missing_to_zero() {
        let model = LinearModel {
            intercept: 1.5,
            air_pressure_coeff: 2.0,
            ambient_pressure_coeff: None,
            air_temp_coeff: Some(0.25),
        };
        let set = to_coefficient_set(&model, "9C:13:9E:BA:DC:91");
        assert_eq!(set.ambient_pressure_coeff, 0.0);
        assert_eq!(set.air_temp_coeff, 0.25);
        assert_eq!(set.target_mac, "9C:13:9E:BA:DC:91");
    }

    #[test]
    fn test_wire_format_has_exact_fields() {
        let set = CoefficientSet {
            intercept: -250.0,
            air_pressure_coeff: 25.0,
            ..Default::default()
        };
        let value: serde_json::Value = serde_json::from_slice(&set.to_wire().unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(
            keys,
            [
                "air_pressure_coeff",
                "air_temp_coeff",
                "ambient_pressure_coeff",
                "intercept",
                "target_mac"
            ]
        );
        assert_eq!(obj["target_mac"], "");
    }

    #[test]
    fn test_wire_format_missing_fields_default_to_zero() {
        let set: CoefficientSet = serde_json::from_str(r#"{"intercept": 4}"#).unwrap();
        assert_eq!(set.intercept, 4.0);
        assert_eq!(set.air_temp_coeff, 0.0);
        assert_eq!(set.target_mac, "");
    }
}
