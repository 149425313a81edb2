use burn::data::dataset::Dataset;
use chrono::NaiveDate;

/// One normalised input window and the targets on its last day.
/// `dynamic` is row-major [seq_length, n_dynamic].
#[derive(Debug, Clone, PartialEq)]
pub struct HydroSample {
    pub basin:   String,
    pub date:    NaiveDate,
    pub dynamic: Vec<f32>,
    pub statics: Vec<f32>,
    pub target:  Vec<f32>,
}

/// Feature widths shared by every sample of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleLayout {
    pub seq_length: usize,
    pub n_dynamic:  usize,
    pub n_static:   usize,
    pub n_targets:  usize,
}

#[derive(Debug, Clone)]
pub struct BasinDataset {
    layout:  SampleLayout,
    targets: Vec<String>,
    basins:  Vec<String>,
    samples: Vec<HydroSample>,
}

impl BasinDataset {
    /// `basins` keeps the requested basins even when some produced no samples.
    pub fn new(
        layout:  SampleLayout,
        targets: Vec<String>,
        basins:  Vec<String>,
        samples: Vec<HydroSample>,
    ) -> Self {
        Self { layout, targets, basins, samples }
    }

    pub fn layout(&self) -> SampleLayout {
        self.layout
    }

    /// Names of the target variables, in output column order.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn basins(&self) -> &[String] {
        &self.basins
    }

    pub fn samples(&self) -> &[HydroSample] {
        &self.samples
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn basin_samples<'a>(&'a self, basin: &'a str) -> impl Iterator<Item = &'a HydroSample> + 'a {
        self.samples.iter().filter(move |s| s.basin == basin)
    }
}

impl Dataset<HydroSample> for BasinDataset {
    fn get(&self, index: usize) -> Option<HydroSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}
