//! Address-space reservation and per-segment mapping.
//!
//! One reservation per image: the whole file mapped at (preferably) the
//! preferred base. The reservation base is both the handle for per-segment
//! work and the rebase delta the parser applies. Segments then get placed
//! one by one, in ascending address order, with the previous segment's
//! geometry deciding how page-sharing edges are handled. Everything stays
//! readable and writable until relocation is done; a finalize pass applies
//! the real protections.

use crate::error::Result;
use crate::heap::config::align_up;
use crate::platform::gate::{MapFlags, MapProt};
use crate::platform::pal::{Pal, Seek};

use super::parser::{ImageFile, ImageInfo, SegmentDescriptor, SegmentProt};

#[derive(Clone, Copy, Debug)]
pub struct Reservation {
    pub base: usize,
    pub size: usize,
}

impl Reservation {
    pub fn delta(&self, info: &ImageInfo) -> usize {
        self.base.wrapping_sub(info.preferred_base)
    }
}

/// Map the entire file at (preferably) the preferred base. The result is
/// the allocator handle for everything below and the rebase delta.
pub unsafe fn reserve_image(
    kernel: &dyn Pal,
    file: &ImageFile,
    info: &ImageInfo,
) -> Result<Reservation> {
    let page = kernel.page_size();
    let size = align_up(info.image_size.max(page), page);
    let base = kernel.map(
        info.preferred_base,
        size,
        MapProt::READ | MapProt::WRITE,
        MapFlags::PRIVATE,
        file.fd,
        0,
    )?;
    Ok(Reservation { base, size })
}

pub unsafe fn release_reservation(kernel: &dyn Pal, reservation: Reservation) {
    let _ = kernel.unmap(reservation.base, reservation.size);
}

fn page_floor(value: usize, page: usize) -> usize {
    value & !(page - 1)
}

/// Place every segment. Segments arrive in increasing virtual-address
/// order; the previous one decides how a shared page edge is treated.
pub unsafe fn map_segments(
    kernel: &dyn Pal,
    file: &mut ImageFile,
    info: &ImageInfo,
    reservation: Reservation,
) -> Result<()> {
    let page = kernel.page_size();
    let delta = reservation.delta(info);
    let mut previous: Option<&SegmentDescriptor> = None;

    for segment in &info.segments {
        let seg_addr = segment.vaddr.wrapping_add(delta);
        let seg_page = page_floor(seg_addr, page);

        if let Some(prev) = previous {
            let prev_end = prev.vaddr.wrapping_add(delta) + prev.mem_size;
            let prev_end_page = align_up(prev_end, page);

            if prev_end > seg_page {
                // The previous segment's end shares the current start page:
                // refill the in-between bytes from the file, zero past the
                // file portion.
                fill_overlap(kernel, file, segment, prev_end, seg_addr)?;
                if prev.prot.contains(SegmentProt::EXEC)
                    || segment.prot.contains(SegmentProt::EXEC)
                {
                    kernel.flush_icache(seg_page, page)?;
                }
            } else if prev_end_page < seg_page {
                // A hole between segments is made inaccessible.
                kernel.protect(prev_end_page, seg_page - prev_end_page, MapProt::empty())?;
            }
        }

        map_segment_body(kernel, file, info, segment, seg_addr, page)?;

        // Anonymous tail past the file-backed portion, and zeroed slack in
        // the last file page.
        let file_end = seg_addr + segment.file_size;
        let mem_end = seg_addr + segment.mem_size;
        if mem_end > file_end {
            let file_end_page = align_up(file_end, page);
            if mem_end > file_end_page {
                kernel.map(
                    file_end_page,
                    align_up(mem_end, page) - file_end_page,
                    MapProt::READ | MapProt::WRITE,
                    MapFlags::ANONYMOUS | MapFlags::PRIVATE | MapFlags::FIXED,
                    -1,
                    0,
                )?;
            }
            let slack = (file_end_page - file_end).min(mem_end - file_end);
            core::ptr::write_bytes(file_end as *mut u8, 0, slack);
            if segment.prot.contains(SegmentProt::EXEC) {
                kernel.flush_icache(file_end, mem_end - file_end)?;
            }
        }

        previous = Some(segment);
    }
    Ok(())
}

/// Bytes between the previous segment's end and the current segment's
/// start, inside the shared page: read from the file where the file has
/// them, zero-filled past that.
unsafe fn fill_overlap(
    kernel: &dyn Pal,
    file: &mut ImageFile,
    segment: &SegmentDescriptor,
    from: usize,
    to: usize,
) -> Result<()> {
    if from >= to {
        return Ok(());
    }
    let span = to - from;
    let filled = if segment.file_offset >= span {
        let offset = segment.file_offset - span;
        kernel.seek(file.fd, offset as i64, Seek::Set)?;
        let buf = core::slice::from_raw_parts_mut(from as *mut u8, span);
        kernel.read(file.fd, buf)?
    } else {
        0
    };
    if filled < span {
        core::ptr::write_bytes((from + filled) as *mut u8, 0, span - filled);
    }
    Ok(())
}

/// The body of one segment: a direct file map when file offset and address
/// agree in their low page bits, otherwise anonymous pages filled by read.
unsafe fn map_segment_body(
    kernel: &dyn Pal,
    file: &mut ImageFile,
    info: &ImageInfo,
    segment: &SegmentDescriptor,
    seg_addr: usize,
    page: usize,
) -> Result<()> {
    if segment.file_size == 0 {
        return Ok(());
    }
    let seg_page = page_floor(seg_addr, page);
    let congruent = segment.file_offset % page == segment.vaddr % page;

    if congruent {
        // The reservation already placed file byte f at base + f; when the
        // segment asks exactly for that, the map is already in place.
        let coincides = segment.vaddr.wrapping_sub(info.preferred_base) == segment.file_offset;
        if coincides {
            return Ok(());
        }
        let map_offset = segment.file_offset - (seg_addr - seg_page);
        let span = align_up(seg_addr + segment.file_size, page) - seg_page;
        kernel.map(
            seg_page,
            span,
            MapProt::READ | MapProt::WRITE,
            MapFlags::PRIVATE | MapFlags::FIXED,
            file.fd,
            map_offset as u64,
        )?;
        return Ok(());
    }

    // Incongruent: anonymous pages at a fixed address inside the
    // reservation, contents read in from the file.
    let span = align_up(seg_addr + segment.file_size, page) - seg_page;
    kernel.map(
        seg_page,
        span,
        MapProt::READ | MapProt::WRITE,
        MapFlags::ANONYMOUS | MapFlags::PRIVATE | MapFlags::FIXED,
        -1,
        0,
    )?;
    kernel.seek(file.fd, segment.file_offset as i64, Seek::Set)?;
    let buf = core::slice::from_raw_parts_mut(seg_addr as *mut u8, segment.file_size);
    let mut read = 0;
    while read < buf.len() {
        let n = kernel.read(file.fd, &mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(())
}

/// After relocation: every segment without the write bit goes read-only,
/// plus executable where applicable.
pub unsafe fn finalize_protections(
    kernel: &dyn Pal,
    info: &ImageInfo,
    reservation: Reservation,
) -> Result<()> {
    let page = kernel.page_size();
    let delta = reservation.delta(info);
    for segment in &info.segments {
        if segment.prot.contains(SegmentProt::WRITE) {
            continue;
        }
        let addr = segment.vaddr.wrapping_add(delta);
        let start = page_floor(addr, page);
        let end = align_up(addr + segment.mem_size, page);
        let mut prot = MapProt::READ;
        if segment.prot.contains(SegmentProt::EXEC) {
            prot |= MapProt::EXEC;
        }
        kernel.protect(start, end - start, prot)?;
    }
    Ok(())
}
