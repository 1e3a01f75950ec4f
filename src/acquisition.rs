// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::fmt;
use std::sync::Arc;

use crate::error::{FwiError, Result};

/// Physical position `[x, y, z]` in model coordinates (z is depth).
pub type Position = [f64; 3];

/// Lifecycle of a shot. Transitions are one-way: Pending → InProgress → Done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShotFlag {
    /// Not started yet.
    Pending,
    /// Forward pass has started.
    InProgress,
    /// Partial gradient written.
    Done,
}

impl fmt::Display for ShotFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShotFlag::Pending => f.write_str("Pending"),
            ShotFlag::InProgress => f.write_str("In Progress"),
            ShotFlag::Done => f.write_str("Done"),
        }
    }
}

/// One source excitation with its receivers.
///
/// `C` is the solver engine configuration the shot is bound to; it is shared
/// between shots through an `Arc` and never inspected by the shot loop.
#[derive(Debug, Clone)]
pub struct Shot<C> {
    id: String,
    sources: Vec<Position>,
    receivers: Vec<Position>,
    dt: f64,
    config: Arc<C>,
    flag: ShotFlag,
}

impl<C> Shot<C> {
    /// Create a pending shot.
    ///
    /// # Errors
    /// Returns an error if `dt` is not positive and finite, or if the shot has
    /// no source or no receiver.
    pub fn new(
        id: impl Into<String>,
        sources: Vec<Position>,
        receivers: Vec<Position>,
        dt: f64,
        config: Arc<C>,
    ) -> Result<Self> {
        let id = id.into();
        if !dt.is_finite() || dt <= 0.0 {
            return Err(FwiError::InvalidTimeStep(dt));
        }
        if sources.is_empty() {
            return Err(FwiError::InvalidAcquisition {
                shot_id: Some(id),
                reason: "shot has no source".to_string(),
            });
        }
        if receivers.is_empty() {
            return Err(FwiError::InvalidAcquisition {
                shot_id: Some(id),
                reason: "shot has no receiver".to_string(),
            });
        }
        Ok(Shot {
            id,
            sources,
            receivers,
            dt,
            config,
            flag: ShotFlag::Pending,
        })
    }

    /// Shot identifier, used in every file name the shot produces.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Source positions. The acoustic pipeline fires the first one.
    pub fn sources(&self) -> &[Position] {
        &self.sources
    }

    /// Receiver positions.
    pub fn receivers(&self) -> &[Position] {
        &self.receivers
    }

    /// Time step shared by the forward and backward passes.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Engine configuration bound to this shot.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Current lifecycle state.
    pub fn flag(&self) -> ShotFlag {
        self.flag
    }

    /// Move the shot to `next`. Regressions and repeated transitions are rejected.
    pub fn advance(&mut self, next: ShotFlag) -> Result<()> {
        if next <= self.flag {
            return Err(FwiError::Other(format!(
                "shot {} cannot move from {} to {}",
                self.id, self.flag, next
            )));
        }
        self.flag = next;
        Ok(())
    }
}

/// Geometry metadata carried alongside the shots.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    /// Model bounding box, `[min, max]` per axis.
    pub boundary: [[f64; 2]; 3],
    /// Depth of every source.
    pub source_depth: f64,
    /// Depth of every receiver.
    pub receivers_depth: f64,
    /// Description of the velocity model (constant value or file path).
    pub velocity_model: String,
}

impl Geometry {
    fn contains(&self, p: &Position) -> bool {
        p.iter()
            .zip(self.boundary.iter())
            .all(|(&v, &[lo, hi])| v >= lo && v <= hi)
    }
}

/// Layout of an equispaced surface acquisition.
///
/// Sources are spread evenly between `start_source_pos` and `end_source_pos`
/// (horizontal `[x, y]`) at `source_depth`; receivers likewise between their
/// start and end at `receivers_depth`. Every shot records on the full
/// receiver line until [`Acquisition::limit_aperture`] trims it.
#[derive(Debug, Clone, PartialEq)]
pub struct EquispacedLayout {
    /// Model bounding box, `[min, max]` per axis.
    pub boundary: [[f64; 2]; 3],
    /// Time step of every shot.
    pub dt: f64,
    /// First source, horizontal coordinates.
    pub start_source_pos: [f64; 2],
    /// Last source, horizontal coordinates.
    pub end_source_pos: [f64; 2],
    /// First receiver, horizontal coordinates.
    pub start_receivers_pos: [f64; 2],
    /// Last receiver, horizontal coordinates.
    pub end_receivers_pos: [f64; 2],
    /// Number of shots.
    pub number_of_sources: usize,
    /// Receivers per shot.
    pub number_of_receivers: usize,
    /// Source depth.
    pub source_depth: f64,
    /// Receiver depth.
    pub receivers_depth: f64,
    /// Description of the velocity model.
    pub velocity_model: String,
}

fn spread(start: [f64; 2], end: [f64; 2], count: usize, depth: f64) -> Vec<Position> {
    (0..count)
        .map(|i| {
            let s = if count > 1 {
                i as f64 / (count - 1) as f64
            } else {
                0.0
            };
            [
                start[0] + s * (end[0] - start[0]),
                start[1] + s * (end[1] - start[1]),
                depth,
            ]
        })
        .collect()
}

/// An ordered sequence of shots plus geometry metadata.
#[derive(Debug, Clone)]
pub struct Acquisition<C> {
    shots: Vec<Shot<C>>,
    geometry: Geometry,
    aperture_limited: bool,
}

impl<C> Acquisition<C> {
    /// Build an acquisition from explicit shots.
    ///
    /// # Errors
    /// Returns an error if there are no shots, if two shots share an id, or if a
    /// source or receiver lies outside the model boundary.
    pub fn new(shots: Vec<Shot<C>>, geometry: Geometry) -> Result<Self> {
        if shots.is_empty() {
            return Err(FwiError::InvalidAcquisition {
                shot_id: None,
                reason: "acquisition has no shots".to_string(),
            });
        }
        for (i, shot) in shots.iter().enumerate() {
            if shots[..i].iter().any(|other| other.id == shot.id) {
                return Err(FwiError::InvalidAcquisition {
                    shot_id: Some(shot.id.clone()),
                    reason: "duplicate shot id".to_string(),
                });
            }
            let outside = shot
                .sources
                .iter()
                .chain(shot.receivers.iter())
                .find(|p| !geometry.contains(p));
            if let Some(p) = outside {
                return Err(FwiError::InvalidAcquisition {
                    shot_id: Some(shot.id.clone()),
                    reason: format!("position {:?} lies outside the model boundary", p),
                });
            }
        }
        Ok(Acquisition {
            shots,
            geometry,
            aperture_limited: false,
        })
    }

    /// Build an equispaced acquisition where every shot shares `config`.
    pub fn equispaced(layout: &EquispacedLayout, config: Arc<C>) -> Result<Self> {
        if layout.number_of_sources == 0 || layout.number_of_receivers == 0 {
            return Err(FwiError::InvalidAcquisition {
                shot_id: None,
                reason: format!(
                    "need at least one source and one receiver, got {} and {}",
                    layout.number_of_sources, layout.number_of_receivers
                ),
            });
        }
        let sources = spread(
            layout.start_source_pos,
            layout.end_source_pos,
            layout.number_of_sources,
            layout.source_depth,
        );
        let receivers = spread(
            layout.start_receivers_pos,
            layout.end_receivers_pos,
            layout.number_of_receivers,
            layout.receivers_depth,
        );

        let shots = sources
            .into_iter()
            .enumerate()
            .map(|(i, source)| {
                Shot::new(
                    format!("{:03}", i + 1),
                    vec![source],
                    receivers.clone(),
                    layout.dt,
                    Arc::clone(&config),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let geometry = Geometry {
            boundary: layout.boundary,
            source_depth: layout.source_depth,
            receivers_depth: layout.receivers_depth,
            velocity_model: layout.velocity_model.clone(),
        };
        Acquisition::new(shots, geometry)
    }

    /// Keep, for each shot, only the receivers within `aperture` (horizontal
    /// distance) of its first source. May be applied only once.
    ///
    /// # Errors
    /// Returns an error if the aperture is negative or not finite, if it was
    /// already applied, or if a shot is left without receivers.
    pub fn limit_aperture(&mut self, aperture: f64) -> Result<()> {
        if !aperture.is_finite() || aperture < 0.0 {
            return Err(FwiError::InvalidConfig(format!(
                "aperture must be non-negative and finite, got {}",
                aperture
            )));
        }
        if self.aperture_limited {
            return Err(FwiError::InvalidConfig(
                "aperture limiting already applied".to_string(),
            ));
        }
        let within = |src: &Position, r: &Position| {
            let dx = r[0] - src[0];
            let dy = r[1] - src[1];
            (dx * dx + dy * dy).sqrt() <= aperture
        };
        // every shot is checked before any is trimmed
        if let Some(shot) = self
            .shots
            .iter()
            .find(|shot| !shot.receivers.iter().any(|r| within(&shot.sources[0], r)))
        {
            return Err(FwiError::InvalidAcquisition {
                shot_id: Some(shot.id.clone()),
                reason: format!("no receiver within aperture {}", aperture),
            });
        }
        for shot in &mut self.shots {
            let src = shot.sources[0];
            shot.receivers.retain(|r| within(&src, r));
        }
        self.aperture_limited = true;
        Ok(())
    }

    /// Shots in acquisition order.
    pub fn shots(&self) -> &[Shot<C>] {
        &self.shots
    }

    pub(crate) fn shots_mut(&mut self) -> &mut [Shot<C>] {
        &mut self.shots
    }

    /// Geometry metadata.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Number of shots.
    pub fn len(&self) -> usize {
        self.shots.len()
    }

    /// Always false for a constructed acquisition.
    pub fn is_empty(&self) -> bool {
        self.shots.is_empty()
    }

    /// True when every shot reached [`ShotFlag::Done`].
    pub fn all_done(&self) -> bool {
        self.shots.iter().all(|s| s.flag == ShotFlag::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> EquispacedLayout {
        EquispacedLayout {
            boundary: [[0.0, 2000.0], [0.0, 2000.0], [0.0, 2000.0]],
            dt: 0.005,
            start_source_pos: [101.0, 1001.0],
            end_source_pos: [1801.0, 1001.0],
            start_receivers_pos: [21.0, 1001.0],
            end_receivers_pos: [1951.0, 1001.0],
            number_of_sources: 3,
            number_of_receivers: 10,
            source_depth: 1901.0,
            receivers_depth: 1951.0,
            velocity_model: "1500".to_string(),
        }
    }

    #[test]
    fn equispaced_positions() {
        let acq = Acquisition::equispaced(&layout(), Arc::new(())).unwrap();
        assert_eq!(acq.len(), 3);
        let ids: Vec<&str> = acq.shots().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["001", "002", "003"]);

        let mid = &acq.shots()[1];
        assert!((mid.sources()[0][0] - 951.0).abs() < 1e-9);
        assert!((mid.sources()[0][2] - 1901.0).abs() < 1e-9);
        assert_eq!(mid.receivers().len(), 10);
        assert!((mid.receivers()[9][0] - 1951.0).abs() < 1e-9);
        assert!(acq
            .shots()
            .iter()
            .all(|s| s.flag() == ShotFlag::Pending && s.dt() == 0.005));
    }

    #[test]
    fn single_source_sits_at_start() {
        let mut l = layout();
        l.number_of_sources = 1;
        let acq = Acquisition::equispaced(&l, Arc::new(())).unwrap();
        assert_eq!(acq.shots()[0].sources()[0], [101.0, 1001.0, 1901.0]);
    }

    #[test]
    fn aperture_limits_receivers() {
        let mut acq = Acquisition::equispaced(&layout(), Arc::new(())).unwrap();
        acq.limit_aperture(300.0).unwrap();
        for shot in acq.shots() {
            let src = shot.sources()[0];
            assert!(!shot.receivers().is_empty());
            for r in shot.receivers() {
                assert!((r[0] - src[0]).abs() <= 300.0);
            }
        }
        // receivers are 214.44 m apart, the first source at x=101 keeps x=21 and x=235.4
        assert_eq!(acq.shots()[0].receivers().len(), 2);
        assert!(acq.limit_aperture(300.0).is_err());
    }

    #[test]
    fn aperture_that_empties_a_shot_is_rejected() {
        let mut acq = Acquisition::equispaced(&layout(), Arc::new(())).unwrap();
        let err = acq.limit_aperture(1.0).unwrap_err();
        assert!(matches!(err, FwiError::InvalidAcquisition { .. }));
    }

    #[test]
    fn failed_aperture_leaves_every_shot_untouched() {
        let cfg = Arc::new(());
        let receivers = vec![[10.0, 0.0, 0.0], [500.0, 0.0, 0.0]];
        let near = Shot::new("001", vec![[0.0; 3]], receivers.clone(), 0.1, Arc::clone(&cfg))
            .unwrap();
        let far = Shot::new("002", vec![[5000.0, 0.0, 0.0]], receivers, 0.1, cfg).unwrap();
        let geometry = Geometry {
            boundary: [[0.0, 6000.0]; 3],
            source_depth: 0.0,
            receivers_depth: 0.0,
            velocity_model: String::new(),
        };
        let mut acq = Acquisition::new(vec![near, far], geometry).unwrap();

        let err = acq.limit_aperture(100.0).unwrap_err();
        assert!(matches!(
            err,
            FwiError::InvalidAcquisition { shot_id: Some(ref id), .. } if id == "002"
        ));
        assert_eq!(acq.shots()[0].receivers().len(), 2);
        assert_eq!(acq.shots()[1].receivers().len(), 2);

        acq.limit_aperture(4600.0).unwrap();
        assert_eq!(acq.shots()[0].receivers().len(), 2);
        assert_eq!(acq.shots()[1].receivers().len(), 1);
    }

    #[test]
    fn flag_never_regresses() {
        let mut shot = Shot::new("7", vec![[0.0; 3]], vec![[1.0; 3]], 0.01, Arc::new(())).unwrap();
        shot.advance(ShotFlag::InProgress).unwrap();
        assert!(shot.advance(ShotFlag::Pending).is_err());
        assert!(shot.advance(ShotFlag::InProgress).is_err());
        shot.advance(ShotFlag::Done).unwrap();
        assert_eq!(shot.flag(), ShotFlag::Done);
        assert!(shot.advance(ShotFlag::InProgress).is_err());
    }

    #[test]
    fn invalid_shots_rejected() {
        let cfg = Arc::new(());
        assert!(matches!(
            Shot::new("a", vec![[0.0; 3]], vec![[0.0; 3]], 0.0, Arc::clone(&cfg)),
            Err(FwiError::InvalidTimeStep(_))
        ));
        assert!(Shot::new("a", vec![], vec![[0.0; 3]], 0.1, Arc::clone(&cfg)).is_err());
        assert!(Shot::new("a", vec![[0.0; 3]], vec![], 0.1, cfg).is_err());
    }

    #[test]
    fn outside_boundary_rejected() {
        let mut l = layout();
        l.receivers_depth = 2500.0;
        assert!(Acquisition::equispaced(&l, Arc::new(())).is_err());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let cfg = Arc::new(());
        let a = Shot::new("1", vec![[0.0; 3]], vec![[1.0; 3]], 0.1, Arc::clone(&cfg)).unwrap();
        let b = Shot::new("1", vec![[0.0; 3]], vec![[1.0; 3]], 0.1, cfg).unwrap();
        let geometry = Geometry {
            boundary: [[0.0, 10.0]; 3],
            source_depth: 0.0,
            receivers_depth: 1.0,
            velocity_model: String::new(),
        };
        assert!(Acquisition::new(vec![a, b], geometry).is_err());
    }
}
