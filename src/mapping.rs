//! Virtually contiguous views over a set of pages.

use crate::page::{Page, PageFrame, PAGE_SIZE};
use crate::{Error, Result};
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapAttr {
    #[default]
    Cacheable,
    WriteCombine,
}

/// A mapping covering `frames.len()` pages.
///
/// While mapped, the region is where those pages' bytes live: pages handed
/// over with [`adopt_pages`](Self::adopt_pages) give up their own buffer, and
/// [`into_pages`](Self::into_pages) hands the contents back. Dropping the
/// mapping only unmaps the region.
pub struct VirtualMapping {
    frames: Box<[PageFrame]>,
    region: MmapMut,
    attr: MapAttr,
}

impl VirtualMapping {
    pub fn nr_pages(&self) -> usize {
        self.frames.len()
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    pub fn frames(&self) -> &[PageFrame] {
        &self.frames
    }

    pub fn attr(&self) -> MapAttr {
        self.attr
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.region.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.region
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.region
    }

    /// Move the contents of `pages` into slots `first..`, leaving `pages`
    /// empty. Each page must be the frame mapped at its slot; on error
    /// nothing is taken.
    pub fn adopt_pages(&mut self, first: usize, pages: &mut Vec<Page>) -> Result<()> {
        let end = first + pages.len();
        if end > self.frames.len() {
            return Err(Error::Mapping(format!(
                "{} pages at slot {} overrun a {}-page mapping",
                pages.len(),
                first,
                self.frames.len()
            )));
        }
        if let Some((slot, page)) = (first..end)
            .zip(pages.iter())
            .find(|(slot, page)| self.frames[*slot] != page.frame())
        {
            return Err(Error::Mapping(format!(
                "{:?} is not the frame mapped at slot {}",
                page.frame(),
                slot
            )));
        }

        for (slot, page) in (first..end).zip(pages.drain(..)) {
            self.region[page_range(slot)].copy_from_slice(page.as_slice());
        }
        Ok(())
    }

    /// Copy the contents of `old` in. Its frames must lead this mapping's.
    pub fn carry_over(&mut self, old: &VirtualMapping) -> Result<()> {
        if !self.frames.starts_with(&old.frames) {
            return Err(Error::Mapping(
                "old mapping's frames are not a prefix of the new one".into(),
            ));
        }
        self.region[..old.region.len()].copy_from_slice(&old.region);
        Ok(())
    }

    /// Unmap and give the pages back, each carrying its contents.
    pub fn into_pages(self) -> Vec<Page> {
        self.frames
            .iter()
            .enumerate()
            .map(|(slot, &frame)| Page::from_bytes(frame, &self.region[page_range(slot)]))
            .collect()
    }
}

fn page_range(slot: usize) -> Range<usize> {
    slot * PAGE_SIZE..(slot + 1) * PAGE_SIZE
}

impl fmt::Debug for VirtualMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMapping")
            .field("nr_pages", &self.frames.len())
            .field("len", &self.region.len())
            .field("attr", &self.attr)
            .finish()
    }
}

pub trait PageMapper: Send + Sync {
    /// A zeroed region covering `frames`, contiguous in address space.
    fn map_pages(&self, frames: &[PageFrame], attr: MapAttr) -> Result<VirtualMapping>;

    /// Release the address range. The frames stay with whoever owns them now.
    fn unmap(&self, mapping: VirtualMapping) {
        drop(mapping);
    }
}

/// Maps anonymous memory sized to the requested frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousMapper;

impl PageMapper for AnonymousMapper {
    fn map_pages(&self, frames: &[PageFrame], attr: MapAttr) -> Result<VirtualMapping> {
        if frames.is_empty() {
            return Err(Error::Mapping("cannot map an empty page list".into()));
        }
        let len = frames
            .len()
            .checked_mul(PAGE_SIZE)
            .ok_or_else(|| Error::Mapping(format!("{} pages overflow", frames.len())))?;
        let region = MmapMut::map_anon(len)
            .map_err(|e| Error::Mapping(format!("anonymous map of {} bytes: {}", len, e)))?;

        debug_assert_eq!(region.len(), len);
        Ok(VirtualMapping {
            frames: frames.into(),
            region,
            attr,
        })
    }
}
