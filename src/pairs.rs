//! View selection from a dense folder's `pair.txt`.
//!
//! The file holds the number of reference views, then for each one its index,
//! the number of ranked sources and `(index, score)` for every source, best
//! first. Images live in `images/%08d.jpg`, calibrations in
//! `cams/%08d_cam.txt`.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{MvsError, Result};
use crate::stream::{MvsSample, ViewPaths};

/// Builds one sample per reference view, keeping at most `view_num - 1` of
/// the best ranked sources.
pub fn load_pair_list(dense_folder: &Path, view_num: usize) -> Result<Vec<MvsSample>> {
    let path = dense_folder.join("pair.txt");
    let text = fs::read_to_string(&path).map_err(|source| MvsError::io(&path, source))?;
    let samples = parse_pair_list(&text, dense_folder, view_num)?;
    debug!("{} reference views listed in {}", samples.len(), path.display());
    Ok(samples)
}

pub fn parse_pair_list(text: &str, dense_folder: &Path, view_num: usize) -> Result<Vec<MvsSample>> {
    let mut tokens = text.split_whitespace();
    let reference_count = next_index(&mut tokens, "the view count")?;
    let mut samples = Vec::with_capacity(reference_count);
    for _ in 0..reference_count {
        let reference = next_index(&mut tokens, "a reference index")?;
        let source_count = next_index(&mut tokens, "a source count")?;
        let mut views = vec![view_paths(dense_folder, reference)];
        for _ in 0..source_count {
            let source = next_index(&mut tokens, "a source index")?;
            // Scores are only used for the ranking, which the file order already gives.
            next_score(&mut tokens)?;
            if views.len() < view_num {
                views.push(view_paths(dense_folder, source));
            }
        }
        samples.push(MvsSample { views, depth: None });
    }
    Ok(samples)
}

fn next_index<'a>(tokens: &mut impl Iterator<Item = &'a str>, what: &str) -> Result<usize> {
    let token = tokens
        .next()
        .ok_or_else(|| MvsError::Parse(format!("pair list ended before {what}")))?;
    token
        .parse()
        .map_err(|_| MvsError::Parse(format!("pair list {what} {token:?} is not an index")))
}

fn next_score<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Result<f64> {
    let token = tokens
        .next()
        .ok_or_else(|| MvsError::Parse("pair list ended before a source score".to_string()))?;
    token
        .parse()
        .map_err(|_| MvsError::Parse(format!("pair list score {token:?} is not a number")))
}

fn view_paths(dense_folder: &Path, index: usize) -> ViewPaths {
    ViewPaths {
        image: dense_folder.join("images").join(format!("{index:08}.jpg")),
        camera: dense_folder.join("cams").join(format!("{index:08}_cam.txt")),
    }
}

/// Points every sample at `<depth_folder>/<id>.pfm` when that file exists.
pub fn attach_depth_maps(samples: &mut [MvsSample], depth_folder: &Path) -> Result<usize> {
    let mut attached = 0;
    for sample in samples.iter_mut() {
        let path = depth_folder.join(format!("{:08}.pfm", sample.sample_id()?));
        if path.is_file() {
            sample.depth = Some(path);
            attached += 1;
        }
    }
    Ok(attached)
}
