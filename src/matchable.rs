use std::collections::BTreeMap;
use std::sync::Arc;

use crate::descriptor::Descriptor;
use crate::{DescriptorId, ImageId};

/// A descriptor together with the images it was observed in.
///
/// A freshly built matchable belongs to exactly one image. An index may
/// coalesce identical descriptors from several images into one matchable, in
/// which case `objects` records the local descriptor id per image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matchable {
    descriptor: Descriptor,
    image_id: ImageId,
    objects: BTreeMap<ImageId, DescriptorId>,
}

impl Matchable {
    pub fn new(descriptor_id: DescriptorId, descriptor: Descriptor, image_id: ImageId) -> Self {
        Self {
            descriptor,
            image_id,
            objects: BTreeMap::from([(image_id, descriptor_id)]),
        }
    }

    /// Build a matchable that already spans several images.
    ///
    /// Returns `None` when `objects` does not contain the owning image.
    pub fn with_objects(
        descriptor: Descriptor,
        image_id: ImageId,
        objects: BTreeMap<ImageId, DescriptorId>,
    ) -> Option<Self> {
        if !objects.contains_key(&image_id) {
            return None;
        }
        Some(Self {
            descriptor,
            image_id,
            objects,
        })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Image this matchable was first created for.
    pub fn image_id(&self) -> ImageId {
        self.image_id
    }

    /// Local descriptor id within the owning image.
    pub fn descriptor_id(&self) -> DescriptorId {
        self.objects[&self.image_id]
    }

    /// Local descriptor id per image this descriptor was observed in.
    pub fn descriptor_id_by_image_id(&self) -> &BTreeMap<ImageId, DescriptorId> {
        &self.objects
    }

    pub fn image_ids(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.objects.keys().copied()
    }

    /// Copy of `self` that additionally records the images of `other`.
    ///
    /// Existing entries win when both sides know the same image.
    pub fn merged_with(&self, other: &Matchable) -> Matchable {
        let mut merged = self.clone();
        for (&image_id, &descriptor_id) in &other.objects {
            merged.objects.entry(image_id).or_insert(descriptor_id);
        }
        merged
    }
}

/// One query descriptor matched against one or more stored matchables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    distance: u32,
    query: Arc<Matchable>,
    references: Vec<Arc<Matchable>>,
    image_ids: Vec<ImageId>,
}

impl Match {
    /// Returns `None` when `references` is empty: a match always points at
    /// least at one stored matchable.
    pub fn new(
        distance: u32,
        query: Arc<Matchable>,
        references: Vec<Arc<Matchable>>,
    ) -> Option<Self> {
        if references.is_empty() {
            return None;
        }
        let mut image_ids: Vec<ImageId> = references.iter().flat_map(|r| r.image_ids()).collect();
        image_ids.sort_unstable();
        image_ids.dedup();

        Some(Self {
            distance,
            query,
            references,
            image_ids,
        })
    }

    pub fn distance(&self) -> u32 {
        self.distance
    }

    pub fn query(&self) -> &Matchable {
        &self.query
    }

    pub fn query_descriptor_id(&self) -> DescriptorId {
        self.query.descriptor_id()
    }

    pub fn query_image_id(&self) -> ImageId {
        self.query.image_id()
    }

    pub fn references(&self) -> &[Arc<Matchable>] {
        &self.references
    }

    /// Sorted, distinct ids of every image referenced by this match.
    pub fn image_ids(&self) -> &[ImageId] {
        &self.image_ids
    }

    /// Descriptor id of the first referenced matchable in its owning image.
    pub fn first_match_id(&self) -> DescriptorId {
        self.references[0].descriptor_id()
    }
}
