//! Grouping of matches by the images they reference.

use std::collections::BTreeMap;

use crate::{ImageId, Match};

/// Matches bucketed per referenced image, with images ranked by bucket size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchPartition {
    by_image: BTreeMap<ImageId, Vec<Match>>,
    ranking: Vec<ImageId>,
}

impl MatchPartition {
    /// Matches filed under `image_id`.
    pub fn get(&self, image_id: ImageId) -> Option<&[Match]> {
        self.by_image.get(&image_id).map(Vec::as_slice)
    }

    pub fn by_image(&self) -> &BTreeMap<ImageId, Vec<Match>> {
        &self.by_image
    }

    /// Image ids ordered by descending match count, ties by ascending id.
    pub fn ranking(&self) -> &[ImageId] {
        &self.ranking
    }

    /// Image with the most matches and its bucket.
    pub fn best(&self) -> Option<(ImageId, &[Match])> {
        let image_id = *self.ranking.first()?;
        self.get(image_id).map(|matches| (image_id, matches))
    }

    /// Number of images with at least one match.
    pub fn len(&self) -> usize {
        self.by_image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_image.is_empty()
    }

    pub fn into_parts(self) -> (BTreeMap<ImageId, Vec<Match>>, Vec<ImageId>) {
        (self.by_image, self.ranking)
    }
}

/// File every match under every image id its references were observed in.
///
/// A match is filed once per (reference, image) pair; nothing is
/// de-duplicated, so a match whose references share an image appears in that
/// image's bucket more than once.
pub fn partition_matches(matches: &[Match]) -> MatchPartition {
    let mut by_image: BTreeMap<ImageId, Vec<Match>> = BTreeMap::new();
    for m in matches {
        for reference in m.references() {
            for image_id in reference.image_ids() {
                by_image.entry(image_id).or_default().push(m.clone());
            }
        }
    }

    let mut sizes: Vec<(ImageId, usize)> = by_image
        .iter()
        .map(|(&image_id, bucket)| (image_id, bucket.len()))
        .collect();
    sizes.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    MatchPartition {
        by_image,
        ranking: sizes.into_iter().map(|(image_id, _)| image_id).collect(),
    }
}
