use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use crc32fast::Hasher;
use tracing::{debug, info};

use crate::descriptor::{Descriptor, DescriptorLayout};
use crate::index::{BinaryIndex, SplittingStrategy};
use crate::{HbstError, ImageId, Match, Matchable};

const PERSIST_MAGIC: [u8; 4] = *b"HBL1";
const PERSIST_VERSION: u32 = 1;
const NO_STRATEGY_TAG: u8 = u8::MAX;

/// Stream wrapper that feeds every byte it moves through a CRC32 hasher.
struct Checksummed<S> {
    stream: S,
    hasher: Hasher,
}

impl<S> Checksummed<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            hasher: Hasher::new(),
        }
    }

    fn finish(self) -> (S, u32) {
        (self.stream, self.hasher.finalize())
    }
}

impl<W: Write> Checksummed<W> {
    fn put(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.hasher.update(bytes);
        self.stream.write_all(bytes)
    }

    fn put_u8(&mut self, value: u8) -> io::Result<()> {
        self.put(&[value])
    }

    fn put_u32(&mut self, value: u32) -> io::Result<()> {
        self.put(&value.to_le_bytes())
    }

    fn put_u64(&mut self, value: u64) -> io::Result<()> {
        self.put(&value.to_le_bytes())
    }
}

impl<R: Read> Checksummed<R> {
    fn take(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.stream.read_exact(buf)?;
        self.hasher.update(buf);
        Ok(())
    }

    fn take_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.take(&mut buf)?;
        Ok(buf)
    }

    fn take_u8(&mut self) -> io::Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    fn take_u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    fn take_u64(&mut self) -> io::Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }
}

/// Exhaustive Hamming-distance index.
///
/// Every query is compared against every stored node. Identical descriptors
/// from different images share one node whose `objects` list all of them.
/// Suitable for small collections and as a reference for tree-based indexes.
#[derive(Debug, Clone)]
pub struct LinearIndex {
    layout: DescriptorLayout,
    nodes: Vec<Arc<Matchable>>,
    positions: HashMap<Descriptor, usize>,
    images: BTreeSet<ImageId>,
    last_strategy: Option<SplittingStrategy>,
}

impl LinearIndex {
    pub fn new(layout: DescriptorLayout) -> Self {
        Self {
            layout,
            nodes: Vec::new(),
            positions: HashMap::new(),
            images: BTreeSet::new(),
            last_strategy: None,
        }
    }

    /// Number of distinct stored descriptors.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Strategy passed to the most recent `train` call.
    pub fn last_strategy(&self) -> Option<SplittingStrategy> {
        self.last_strategy
    }

    pub fn nodes(&self) -> &[Arc<Matchable>] {
        &self.nodes
    }

    fn check_width(&self, descriptor: &Descriptor) -> Result<(), HbstError> {
        if descriptor.width_bits() != self.layout.bits() {
            return Err(HbstError::DescriptorWidth {
                expected: self.layout.bytes(),
                got: descriptor.as_bytes().len(),
            });
        }
        Ok(())
    }

    fn check_queries(&self, queries: &[Arc<Matchable>]) -> Result<(), HbstError> {
        queries
            .iter()
            .try_for_each(|query| self.check_width(query.descriptor()))
    }

    fn insert(&mut self, matchable: Matchable) {
        self.images.extend(matchable.image_ids());
        match self.positions.get(matchable.descriptor()) {
            Some(&position) => {
                let merged = self.nodes[position].merged_with(&matchable);
                self.nodes[position] = Arc::new(merged);
            }
            None => {
                self.positions
                    .insert(matchable.descriptor().clone(), self.nodes.len());
                self.nodes.push(Arc::new(matchable));
            }
        }
    }

    /// Persist the index to the provided filesystem path.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), HbstError> {
        let file = File::create(path)?;
        self.save_to_writer(BufWriter::new(file))
    }

    /// Persist the index using the supplied writer.
    ///
    /// Layout: magic and version, then the checksummed body (descriptor
    /// bits, strategy tag, node records), then the CRC32 of the body.
    pub fn save_to_writer<W: Write>(&self, writer: W) -> Result<(), HbstError> {
        let mut writer = BufWriter::new(writer);
        writer.write_all(&PERSIST_MAGIC)?;
        writer.write_all(&PERSIST_VERSION.to_le_bytes())?;

        let mut body = Checksummed::new(&mut writer);
        let bits = u32::try_from(self.layout.bits()).map_err(|_| {
            HbstError::InvalidPersistence("descriptor width exceeds persistence limits")
        })?;
        body.put_u32(bits)?;
        body.put_u8(
            self.last_strategy
                .map_or(NO_STRATEGY_TAG, SplittingStrategy::as_u8),
        )?;

        body.put_u64(self.nodes.len() as u64)?;
        for node in &self.nodes {
            body.put(node.descriptor().as_bytes())?;
            body.put_u64(node.image_id())?;

            let objects = node.descriptor_id_by_image_id();
            let object_count = u32::try_from(objects.len()).map_err(|_| {
                HbstError::InvalidPersistence("object count exceeds persistence limits")
            })?;
            body.put_u32(object_count)?;
            for (&image_id, &descriptor_id) in objects {
                body.put_u64(image_id)?;
                body.put_u64(descriptor_id)?;
            }
        }

        let (writer, checksum) = body.finish();
        writer.write_all(&checksum.to_le_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Load an index from the provided filesystem path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, HbstError> {
        let file = File::open(path)?;
        Self::load_from_reader(BufReader::new(file))
    }

    /// Load an index from a persisted byte stream.
    pub fn load_from_reader<R: Read>(reader: R) -> Result<Self, HbstError> {
        Self::load(reader, None)
    }

    /// Like [`LinearIndex::load_from_reader`], rejecting a stream whose
    /// descriptor width differs from `layout` before any node is read.
    pub fn load_with_layout<R: Read>(
        reader: R,
        layout: DescriptorLayout,
    ) -> Result<Self, HbstError> {
        Self::load(reader, Some(layout))
    }

    fn load<R: Read>(reader: R, expected: Option<DescriptorLayout>) -> Result<Self, HbstError> {
        let mut reader = BufReader::new(reader);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != PERSIST_MAGIC {
            return Err(HbstError::InvalidPersistence("unrecognized file header"));
        }
        let mut version = [0u8; 4];
        reader.read_exact(&mut version)?;
        if u32::from_le_bytes(version) != PERSIST_VERSION {
            return Err(HbstError::InvalidPersistence(
                "unsupported index format version",
            ));
        }

        let mut body = Checksummed::new(&mut reader);
        let bits = body.take_u32()? as usize;
        let layout = DescriptorLayout::new(bits)
            .map_err(|_| HbstError::InvalidPersistence("descriptor width must be positive"))?;
        if expected.is_some_and(|expected| expected != layout) {
            return Err(HbstError::InvalidPersistence(
                "persisted descriptor width does not match the index",
            ));
        }

        let last_strategy = match body.take_u8()? {
            NO_STRATEGY_TAG => None,
            tag => Some(
                SplittingStrategy::from_u8(tag)
                    .ok_or(HbstError::InvalidPersistence("unknown splitting strategy tag"))?,
            ),
        };

        let node_count = usize::try_from(body.take_u64()?)
            .map_err(|_| HbstError::InvalidPersistence("node count exceeds platform limits"))?;
        let mut index = Self::new(layout);
        index.last_strategy = last_strategy;

        for _ in 0..node_count {
            let mut packed = vec![0u8; layout.bytes()];
            body.take(&mut packed)?;
            let descriptor = Descriptor::from_packed(layout, packed)
                .map_err(|_| HbstError::InvalidPersistence("descriptor has stray trailing bits"))?;

            let owner = body.take_u64()?;
            let object_count = body.take_u32()?;
            let mut objects = BTreeMap::new();
            for _ in 0..object_count {
                let image_id = body.take_u64()?;
                let descriptor_id = body.take_u64()?;
                objects.insert(image_id, descriptor_id);
            }

            let matchable = Matchable::with_objects(descriptor, owner, objects).ok_or(
                HbstError::InvalidPersistence("node does not list its owning image"),
            )?;
            if index.positions.contains_key(matchable.descriptor()) {
                return Err(HbstError::InvalidPersistence("duplicate descriptor node"));
            }
            index.insert(matchable);
        }

        let (reader, computed_checksum) = body.finish();
        let mut stored = [0u8; 4];
        reader.read_exact(&mut stored)?;
        if computed_checksum != u32::from_le_bytes(stored) {
            return Err(HbstError::InvalidPersistence("checksum mismatch"));
        }

        Ok(index)
    }
}

impl BinaryIndex for LinearIndex {
    fn layout(&self) -> DescriptorLayout {
        self.layout
    }

    fn add(
        &mut self,
        matchables: Vec<Matchable>,
        strategy: SplittingStrategy,
    ) -> Result<(), HbstError> {
        matchables
            .iter()
            .try_for_each(|matchable| self.check_width(matchable.descriptor()))?;

        let added = matchables.len();
        for matchable in matchables {
            self.insert(matchable);
        }
        debug!(
            added,
            nodes = self.nodes.len(),
            images = self.images.len(),
            ?strategy,
            "added matchables to linear index"
        );
        Ok(())
    }

    fn train(&mut self, strategy: SplittingStrategy) -> Result<(), HbstError> {
        self.last_strategy = Some(strategy);
        debug!(?strategy, nodes = self.nodes.len(), "trained linear index");
        Ok(())
    }

    fn match_exact(
        &self,
        queries: &[Arc<Matchable>],
        max_distance: u32,
    ) -> Result<Vec<Match>, HbstError> {
        self.check_queries(queries)?;

        let mut matches = Vec::new();
        for query in queries {
            let mut best = u32::MAX;
            let mut references = Vec::new();
            for node in &self.nodes {
                let distance = query.descriptor().hamming_distance(node.descriptor());
                if distance < best {
                    best = distance;
                    references.clear();
                    references.push(Arc::clone(node));
                } else if distance == best {
                    references.push(Arc::clone(node));
                }
            }
            if best <= max_distance {
                matches.extend(Match::new(best, Arc::clone(query), references));
            }
        }
        Ok(matches)
    }

    fn match_lazy(
        &self,
        queries: &[Arc<Matchable>],
        max_distance: u32,
    ) -> Result<Vec<Match>, HbstError> {
        self.check_queries(queries)?;

        let mut matches = Vec::new();
        for query in queries {
            let hit = self.nodes.iter().find_map(|node| {
                let distance = query.descriptor().hamming_distance(node.descriptor());
                (distance <= max_distance).then(|| (distance, Arc::clone(node)))
            });
            if let Some((distance, node)) = hit {
                matches.extend(Match::new(distance, Arc::clone(query), vec![node]));
            }
        }
        Ok(matches)
    }

    fn clear(&mut self) {
        *self = Self::new(self.layout);
    }

    fn read(&mut self, path: &Path) -> Result<(), HbstError> {
        let file = File::open(path)?;
        let loaded = Self::load_with_layout(BufReader::new(file), self.layout)?;
        info!(
            path = %path.display(),
            nodes = loaded.nodes.len(),
            images = loaded.images.len(),
            "loaded linear index"
        );
        *self = loaded;
        Ok(())
    }

    fn write(&self, path: &Path) -> Result<(), HbstError> {
        self.save_to_path(path)?;
        info!(path = %path.display(), nodes = self.nodes.len(), "saved linear index");
        Ok(())
    }

    fn size(&self) -> usize {
        self.images.len()
    }
}
