//! Tempo and meter sections, and the measure lookup derived from them.
//!
//! A [`TempoMap`] lays sections out on the timeline:
//! - the optional pre-section (count-off) occupies negative measures and ends
//!   at time zero;
//! - inserted sections follow one another from measure zero;
//! - the post-section repeats for as long as the timeline runs.

use std::{collections::BTreeMap, rc::Rc};

use serde::{Deserialize, Serialize};

use crate::{LooplineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetronomeSound {
    #[default]
    Click,
    Off,
}

/// A run of bars sharing tempo and meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub bpm: f64,
    pub beats_per_bar: u32,
    #[serde(default)]
    pub metronome_sound: MetronomeSound,
    /// How often the section (or its sub-sections) repeats.
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
    #[serde(default)]
    pub sub_sections: Vec<Section>,
}

fn default_repetitions() -> u32 {
    1
}

impl Section {
    pub fn new(bpm: f64, beats_per_bar: u32) -> Self {
        Self {
            bpm,
            beats_per_bar,
            metronome_sound: MetronomeSound::Click,
            repetitions: 1,
            sub_sections: Vec::new(),
        }
    }

    pub fn repeated(mut self, repetitions: u32) -> Self {
        self.repetitions = repetitions;
        self
    }

    pub fn silent(mut self) -> Self {
        self.metronome_sound = MetronomeSound::Off;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(self.bpm.is_finite() && self.bpm > 0.0) {
            return Err(LooplineError::InvalidInput("section tempo must be positive"));
        }
        if self.beats_per_bar == 0 {
            return Err(LooplineError::InvalidInput(
                "section needs at least one beat per bar",
            ));
        }
        self.sub_sections.iter().try_for_each(Section::validate)
    }

    /// Flattens the section into one entry per bar.
    fn bars(&self, out: &mut Vec<SectionInfo>) {
        for _ in 0..self.repetitions {
            if self.sub_sections.is_empty() {
                out.push(SectionInfo {
                    bpm: self.bpm,
                    beats_per_bar: self.beats_per_bar,
                    metronome_sound: self.metronome_sound,
                });
            } else {
                for sub in &self.sub_sections {
                    sub.bars(out);
                }
            }
        }
    }
}

/// Tempo and meter of a single measure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectionInfo {
    pub bpm: f64,
    pub beats_per_bar: u32,
    pub metronome_sound: MetronomeSound,
}

impl SectionInfo {
    pub fn beat_duration(&self) -> f64 {
        60.0 / self.bpm
    }

    pub fn measure_duration(&self) -> f64 {
        self.beat_duration() * f64::from(self.beats_per_bar)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasureStart {
    pub time_start: f64,
    pub section: SectionInfo,
}

/// Measures keyed by their number.
pub type MeasureMap = BTreeMap<i64, MeasureStart>;

/// Lookup returning every measure that overlaps `[start, end)`.
pub type MeasureMapFn = Rc<dyn Fn(f64, f64) -> MeasureMap>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoMap {
    #[serde(default)]
    pub pre_section: Option<Section>,
    #[serde(default)]
    pub inserted_sections: Vec<Section>,
    pub post_section: Section,
    #[serde(skip)]
    layout: Layout,
}

#[derive(Debug, Clone, PartialEq, Default)]
struct Layout {
    pre: Vec<SectionInfo>,
    inserted: Vec<SectionInfo>,
    post: Vec<SectionInfo>,
}

impl TempoMap {
    pub fn new(
        pre_section: Option<Section>,
        inserted_sections: Vec<Section>,
        post_section: Section,
    ) -> Result<Self> {
        let mut map = Self {
            pre_section,
            inserted_sections,
            post_section,
            layout: Layout::default(),
        };
        map.rebuild()?;
        Ok(map)
    }

    /// A single tempo and meter for the whole timeline.
    pub fn constant(bpm: f64, beats_per_bar: u32) -> Result<Self> {
        Self::new(None, Vec::new(), Section::new(bpm, beats_per_bar))
    }

    /// Recomputes the bar layout. Needed after deserializing or editing sections.
    pub fn rebuild(&mut self) -> Result<()> {
        self.post_section.validate()?;
        self.inserted_sections.iter().try_for_each(Section::validate)?;
        if let Some(pre) = &self.pre_section {
            pre.validate()?;
        }

        let mut layout = Layout::default();
        if let Some(pre) = &self.pre_section {
            pre.bars(&mut layout.pre);
        }
        for section in &self.inserted_sections {
            section.bars(&mut layout.inserted);
        }
        self.post_section.bars(&mut layout.post);
        if layout.post.is_empty() {
            return Err(LooplineError::InvalidInput(
                "post section must contain at least one bar",
            ));
        }

        self.layout = layout;
        Ok(())
    }

    /// Length of the count-off before measure zero.
    pub fn pre_roll_duration(&self) -> f64 {
        self.layout.pre.iter().map(SectionInfo::measure_duration).sum()
    }

    /// Every measure overlapping `[start, end)`.
    pub fn measure_map(&self, start: f64, end: f64) -> MeasureMap {
        let mut map = MeasureMap::new();
        // The post-section repeats forever, so the range has to be bounded.
        if !start.is_finite() || !end.is_finite() || end <= start {
            return map;
        }

        let mut time = 0.0;
        for (index, section) in self.layout.pre.iter().enumerate().rev() {
            time -= section.measure_duration();
            if time >= end {
                continue;
            }
            if time + section.measure_duration() <= start {
                break;
            }
            let number = index as i64 - self.layout.pre.len() as i64;
            map.insert(
                number,
                MeasureStart {
                    time_start: time,
                    section: *section,
                },
            );
        }

        let post = self.layout.post.iter().cycle();
        let mut time = 0.0;
        for (number, section) in self.layout.inserted.iter().chain(post).enumerate() {
            if time >= end {
                break;
            }
            let duration = section.measure_duration();
            if time + duration > start {
                map.insert(
                    number as i64,
                    MeasureStart {
                        time_start: time,
                        section: *section,
                    },
                );
            }
            time += duration;
        }

        map
    }

    /// Shared lookup suitable for [`crate::Metronome`].
    pub fn lookup(self) -> MeasureMapFn {
        let map = Rc::new(self);
        Rc::new(move |start, end| map.measure_map(start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_tempo_measures_cover_range() {
        let map = TempoMap::constant(120.0, 4).unwrap().measure_map(0.0, 4.0);

        let starts: Vec<(i64, f64)> = map.iter().map(|(n, m)| (*n, m.time_start)).collect();
        assert_eq!(starts, vec![(0, 0.0), (1, 2.0)]);
    }

    #[test]
    fn unbounded_ranges_yield_no_measures() {
        let tempo = TempoMap::constant(120.0, 4).unwrap();

        assert!(tempo.measure_map(0.0, f64::INFINITY).is_empty());
        assert!(tempo.measure_map(f64::NAN, 4.0).is_empty());
        assert!(tempo.measure_map(f64::NEG_INFINITY, 4.0).is_empty());
    }

    #[test]
    fn partially_overlapping_measures_are_included() {
        let map = TempoMap::constant(120.0, 4).unwrap().measure_map(3.0, 4.5);

        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn inserted_sections_precede_post_section() {
        let tempo = TempoMap::new(
            None,
            vec![Section::new(60.0, 3).repeated(2)],
            Section::new(120.0, 4),
        )
        .unwrap();

        let map = tempo.measure_map(0.0, 10.0);
        assert_eq!(map[&0].time_start, 0.0);
        assert_eq!(map[&1].time_start, 3.0);
        assert_eq!(map[&2].time_start, 6.0);
        assert_eq!(map[&2].section.bpm, 120.0);
        assert_eq!(map[&3].time_start, 8.0);
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn pre_section_counts_off_in_negative_measures() {
        let tempo = TempoMap::new(
            Some(Section::new(120.0, 4).repeated(2)),
            Vec::new(),
            Section::new(120.0, 4),
        )
        .unwrap();

        assert_eq!(tempo.pre_roll_duration(), 4.0);
        let map = tempo.measure_map(-4.0, 1.0);
        let starts: Vec<(i64, f64)> = map.iter().map(|(n, m)| (*n, m.time_start)).collect();
        assert_eq!(starts, vec![(-2, -4.0), (-1, -2.0), (0, 0.0)]);
    }

    #[test]
    fn sub_sections_repeat_as_a_group() {
        let mut group = Section::new(120.0, 4).repeated(2);
        group.sub_sections = vec![Section::new(120.0, 4), Section::new(120.0, 2).silent()];
        let tempo = TempoMap::new(None, vec![group], Section::new(120.0, 4)).unwrap();

        let map = tempo.measure_map(0.0, 6.0);
        let meters: Vec<u32> = map.values().map(|m| m.section.beats_per_bar).collect();
        assert_eq!(meters, vec![4, 2, 4, 2]);
        assert_eq!(map[&1].section.metronome_sound, MetronomeSound::Off);
    }

    #[test]
    fn rejects_invalid_sections() {
        assert!(TempoMap::constant(0.0, 4).is_err());
        assert!(TempoMap::constant(120.0, 0).is_err());
        assert!(TempoMap::new(None, Vec::new(), Section::new(120.0, 4).repeated(0)).is_err());
    }

    #[test]
    fn deserialized_maps_need_rebuild() {
        let mut tempo: TempoMap = serde_json::from_str(
            r#"{ "post_section": { "bpm": 90.0, "beats_per_bar": 3 } }"#,
        )
        .unwrap();
        tempo.rebuild().unwrap();

        let map = tempo.measure_map(0.0, 2.0);
        assert_eq!(map[&0].section.beats_per_bar, 3);
        assert_eq!(map[&1].time_start, 2.0);
    }
}
