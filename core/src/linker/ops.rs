//! Load, rebase, link, and register operations over a `CroModuleView`,
//! and the live-module list they maintain.

use crate::error::{LinkerFault, LinkerWarning, SymbolName};
use crate::linker::format::*;
use crate::linker::module::{rebase_field_if_nonzero, CroModuleView};
use crate::memory::Memory;

/// Reject a module whose magic doesn't read `"CRO0"`, or that is already
/// linked into a live-module list.
pub fn load(mem: &dyn Memory, view: &CroModuleView) -> Result<(), LinkerFault> {
    view.check_magic(mem)?;
    if view.next(mem) != 0 || view.prev(mem) != 0 {
        return Err(LinkerFault::AlreadyLoaded);
    }
    Ok(())
}

fn segment_tag_to_address(mem: &dyn Memory, view: &CroModuleView, tag: u32) -> u32 {
    let (byte_offset, segment_index) = unpack_segment_tag(tag);
    view.segment_entry(mem, segment_index).offset + byte_offset
}

fn resolve_patch_target(mem: &dyn Memory, view: &CroModuleView, tag: u32, old_data_vaddr: u32) -> Result<u32, LinkerFault> {
    let (byte_offset, segment_index) = unpack_segment_tag(tag);
    let segment = view.segment_entry(mem, segment_index);
    match SegmentId::from_raw(segment.id) {
        Some(SegmentId::Data) => Ok(old_data_vaddr + byte_offset),
        Some(_) => Ok(segment.offset + byte_offset),
        None => Err(LinkerFault::UnknownSegmentId(segment.id)),
    }
}

fn patch_symbol(mem: &mut dyn Memory, target: u32, patch_type: u8, addend: i32, symbol_address: u32) -> Result<(), LinkerFault> {
    if patch_type != PATCH_TYPE_ABSOLUTE_ADDRESS {
        return Err(LinkerFault::UnknownPatchType(patch_type));
    }
    let value = (symbol_address as i64 + addend as i64) as u32;
    mem.write32(target, value);
    Ok(())
}

/// Walk a contiguous run of relocation-patch records starting at
/// `start_addr`, applying each against `symbol_address` until a record
/// with `is_last_entry` is consumed.
fn apply_patch_batch(
    mem: &mut dyn Memory,
    view: &CroModuleView,
    start_addr: u32,
    symbol_address: u32,
    old_data_vaddr: u32,
) -> Result<(), LinkerFault> {
    let mut addr = start_addr;
    loop {
        let record = CroModuleView::read_patch_record(mem, addr);
        let target = resolve_patch_target(mem, view, record.segment_tag, old_data_vaddr)?;
        patch_symbol(mem, target, record.patch_type, record.addend, symbol_address)?;
        if record.is_last_entry {
            CroModuleView::mark_patch_resolved(mem, addr);
            return Ok(());
        }
        addr += RELOCATION_PATCH_ENTRY_STRIDE;
    }
}

/// Same walk as `apply_patch_batch`, but resolves each record's target
/// through the plain segment-table lookup (`segment_tag_to_address`)
/// instead of the DATA-override path. `link` uses this: by the time it
/// runs, segment-table entry #2's offset has already been temporarily
/// pointed at the CRO's own `data_offset`, so the plain lookup lands on
/// the right word without needing `old_data_vaddr` at all.
fn apply_patch_batch_plain(mem: &mut dyn Memory, view: &CroModuleView, start_addr: u32, symbol_address: u32) -> Result<(), LinkerFault> {
    let mut addr = start_addr;
    loop {
        let record = CroModuleView::read_patch_record(mem, addr);
        let target = segment_tag_to_address(mem, view, record.segment_tag);
        patch_symbol(mem, target, record.patch_type, record.addend, symbol_address)?;
        if record.is_last_entry {
            CroModuleView::mark_patch_resolved(mem, addr);
            return Ok(());
        }
        addr += RELOCATION_PATCH_ENTRY_STRIDE;
    }
}

fn find_named_export(mem: &dyn Memory, crs_vaddr: u32, name: &str) -> Option<u32> {
    let mut cursor = crs_vaddr;
    while cursor != 0 {
        let view = CroModuleView::new(cursor);
        for i in 0..view.named_export_count(mem) {
            let entry = view.named_export_entry(mem, i);
            if mem.read_string(entry.name_offset, MAX_EXPORT_NAME_LEN as usize) == name {
                return Some(segment_tag_to_address(mem, &view, entry.segment_tag));
            }
        }
        cursor = view.next(mem);
    }
    None
}

/// Rewrite the module's rebase-eligible header offsets, and for CRO
/// modules (not the CRS) rewrite the segment table, the import/export
/// tables, apply internal relocations, and patch the exit-symbol import
/// if present.
pub fn rebase(
    mem: &mut dyn Memory,
    view: &CroModuleView,
    map_vaddr: u32,
    data_vaddr: u32,
    bss_vaddr: u32,
    is_crs: bool,
    crs_vaddr: u32,
) -> Result<(), LinkerFault> {
    view.rebase_header_offsets(mem, map_vaddr);

    if is_crs {
        return Ok(());
    }

    let mut old_data_vaddr = 0u32;
    for i in 0..view.segment_count(mem) {
        let entry = view.segment_entry(mem, i);
        match SegmentId::from_raw(entry.id) {
            Some(SegmentId::Text) | Some(SegmentId::Rodata) => {
                view.set_segment_offset(mem, i, entry.offset + map_vaddr);
            }
            Some(SegmentId::Data) => {
                old_data_vaddr = data_vaddr + entry.offset;
                view.set_segment_offset(mem, i, data_vaddr);
            }
            Some(SegmentId::Bss) => {
                view.set_segment_offset(mem, i, bss_vaddr);
            }
            None => return Err(LinkerFault::UnknownSegmentId(entry.id)),
        }
    }

    let (named_export_addr, named_export_count) = (view.named_export_table_offset(mem), view.named_export_count(mem));
    rebase_name_offset_table(mem, named_export_addr, named_export_count, NAMED_EXPORT_ENTRY_STRIDE, &[0], map_vaddr);
    let (named_import_addr, named_import_count) = (view.named_import_table_offset(mem), view.named_import_count(mem));
    rebase_name_offset_table(mem, named_import_addr, named_import_count, NAMED_IMPORT_ENTRY_STRIDE, &[0, 4], map_vaddr);
    let (indexed_import_addr, indexed_import_count) = (view.indexed_import_table_offset(mem), view.indexed_import_count(mem));
    rebase_name_offset_table(mem, indexed_import_addr, indexed_import_count, INDEXED_IMPORT_ENTRY_STRIDE, &[4], map_vaddr);
    let (anonymous_import_addr, anonymous_import_count) = (view.anonymous_import_table_offset(mem), view.anonymous_import_count(mem));
    rebase_name_offset_table(mem, anonymous_import_addr, anonymous_import_count, ANONYMOUS_IMPORT_ENTRY_STRIDE, &[4], map_vaddr);
    let (import_module_addr, import_module_count) = (view.import_module_table_offset(mem), view.import_module_count(mem));
    rebase_name_offset_table(mem, import_module_addr, import_module_count, IMPORT_MODULE_ENTRY_STRIDE, &[0, 4, 12], map_vaddr);

    for i in 0..view.relocation_patch_count(mem) {
        let addr = view.relocation_patch_table_offset(mem) + i * RELOCATION_PATCH_ENTRY_STRIDE;
        let record = CroModuleView::read_patch_record(mem, addr);
        if record.is_resolved {
            continue;
        }
        let target = resolve_patch_target(mem, view, record.segment_tag, old_data_vaddr)?;
        let symbol_address = view.segment_entry(mem, record.segment_index as u32).offset;
        patch_symbol(mem, target, record.patch_type, record.addend, symbol_address)?;
        CroModuleView::mark_patch_resolved(mem, addr);
    }

    rewrite_exit_symbol_import(mem, view, crs_vaddr, old_data_vaddr);

    Ok(())
}

fn rebase_name_offset_table(mem: &mut dyn Memory, table_addr: u32, count: u32, stride: u32, field_offsets: &[u32], map_vaddr: u32) {
    for i in 0..count {
        let entry_addr = table_addr + i * stride;
        for &field_off in field_offsets {
            rebase_field_if_nonzero(mem, entry_addr + field_off, map_vaddr);
        }
    }
}

fn rewrite_exit_symbol_import(mem: &mut dyn Memory, view: &CroModuleView, crs_vaddr: u32, old_data_vaddr: u32) {
    let import_string_max = view.import_strings_size(mem);
    for i in 0..view.named_import_count(mem) {
        let entry = view.named_import_entry(mem, i);
        if mem.read_string(entry.name_offset, import_string_max as usize) != EXIT_SYMBOL_IMPORT_NAME {
            continue;
        }
        match find_named_export(mem, crs_vaddr, EXIT_SYMBOL_EXPORT_NAME) {
            Some(addr) => {
                let _ = apply_patch_batch(mem, view, entry.relocation_offset, addr, old_data_vaddr);
            }
            None => log::warn!("{}", LinkerWarning::ExitSymbolUnresolved),
        }
        return;
    }
}

/// Resolve named imports against every live module's named-export
/// table, then perform module-import linkage (unimplemented, by design:
/// a non-empty import-module table or anonymous-import table faults).
///
/// ldr:ro assumes segment-table entry #2 is `.data`: for the duration of
/// named-import resolution its offset is temporarily overwritten with
/// the CRO's own (pre-rebase) `data_offset` header field, then restored,
/// so a relocation that targets `.data` patches the right word without
/// reusing rebase's `old_data_vaddr` override.
pub fn link(mem: &mut dyn Memory, view: &CroModuleView, crs_vaddr: u32) -> Result<(), LinkerFault> {
    if view.import_module_count(mem) > 0 {
        return Err(LinkerFault::ModuleImportUnimplemented);
    }
    if view.anonymous_import_count(mem) > 0 {
        return Err(LinkerFault::StaticAnonymousUnimplemented);
    }

    let saved_data_segment_offset = if view.segment_count(mem) > 1 {
        let saved = view.segment_entry(mem, 2).offset;
        let data_offset = view.data_offset(mem);
        view.set_segment_offset(mem, 2, data_offset);
        Some(saved)
    } else {
        None
    };

    let result = link_named_imports(mem, view, crs_vaddr);

    if let Some(saved) = saved_data_segment_offset {
        view.set_segment_offset(mem, 2, saved);
    }

    result
}

fn link_named_imports(mem: &mut dyn Memory, view: &CroModuleView, crs_vaddr: u32) -> Result<(), LinkerFault> {
    let import_string_max = view.import_strings_size(mem);
    for i in 0..view.named_import_count(mem) {
        let entry = view.named_import_entry(mem, i);
        let first_record = CroModuleView::read_patch_record(mem, entry.relocation_offset);
        if first_record.is_resolved {
            continue;
        }
        let name = mem.read_string(entry.name_offset, import_string_max as usize);
        let symbol_address =
            find_named_export(mem, crs_vaddr, &name).ok_or_else(|| LinkerFault::SymbolUnresolved(SymbolName::new(&name)))?;
        apply_patch_batch_plain(mem, view, entry.relocation_offset, symbol_address)?;
    }
    Ok(())
}

/// Append `cro_vaddr` to the auto-link (`next`-rooted) or manual
/// (`prev`-rooted) chain hanging off the CRS. `CRS.prev` always ends up
/// pointing at the first-ever-registered module, doubling as the tail
/// pointer for whichever chain is non-empty.
pub fn register(mem: &mut dyn Memory, crs_vaddr: u32, cro_vaddr: u32, auto_link: bool) {
    let crs = CroModuleView::new(crs_vaddr);
    let cro = CroModuleView::new(cro_vaddr);
    let head = if auto_link { crs.next(mem) } else { crs.prev(mem) };

    if head == 0 {
        crs.set_prev(mem, cro_vaddr);
        if auto_link {
            crs.set_next(mem, cro_vaddr);
        }
        cro.set_prev(mem, cro_vaddr); // head.prev doubles as the O(1) tail pointer
        return;
    }

    let head_view = CroModuleView::new(head);
    let tail = head_view.prev(mem);
    cro.set_prev(mem, tail);
    CroModuleView::new(tail).set_next(mem, cro_vaddr);
    head_view.set_prev(mem, cro_vaddr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;

    fn make_cro(mem: &mut FlatMemory, vaddr: u32) -> CroModuleView {
        mem.write_slice(vaddr + OFF_MAGIC, MAGIC);
        CroModuleView::new(vaddr)
    }

    #[test]
    fn load_rejects_bad_magic() {
        let mut mem = FlatMemory::new(0x200);
        mem.write_slice(OFF_MAGIC, b"XRO0");
        let view = CroModuleView::new(0);
        assert_eq!(load(&mem, &view), Err(LinkerFault::BadMagic));
    }

    #[test]
    fn load_rejects_already_linked_module() {
        let mut mem = FlatMemory::new(0x200);
        let view = make_cro(&mut mem, 0);
        view.set_next(&mut mem, 0x1234);
        assert_eq!(load(&mem, &view), Err(LinkerFault::AlreadyLoaded));
    }

    #[test]
    fn register_builds_auto_link_chain_with_tail_pointer() {
        let mut mem = FlatMemory::new(0x400);
        let crs_vaddr = 0u32;
        make_cro(&mut mem, crs_vaddr);

        register(&mut mem, crs_vaddr, 0x100, true);
        register(&mut mem, crs_vaddr, 0x200, true);
        register(&mut mem, crs_vaddr, 0x300, true);

        let crs = CroModuleView::new(crs_vaddr);
        assert_eq!(crs.next(&mem), 0x100);
        assert_eq!(crs.prev(&mem), 0x100); // first-ever-registered

        let first = CroModuleView::new(0x100);
        assert_eq!(first.prev(&mem), 0x300); // head.prev is the tail
        assert_eq!(first.next(&mem), 0x200);

        let second = CroModuleView::new(0x200);
        assert_eq!(second.next(&mem), 0x300);

        let third = CroModuleView::new(0x300);
        assert_eq!(third.next(&mem), 0);
    }

    #[test]
    fn named_import_resolves_against_exporting_module() {
        let mut mem = FlatMemory::new(0x2000);
        let crs_vaddr = 0x10u32; // nonzero: 0 is the live-list null sentinel
        make_cro(&mut mem, crs_vaddr);

        // Exporter: one named export "foo" pointing at TEXT+0x10.
        let exporter_vaddr = 0x100;
        let exporter = make_cro(&mut mem, exporter_vaddr);
        exporter.set_header_u32_for_test(&mut mem, OFF_SEGMENT_TABLE_OFFSET, exporter_vaddr + 0x200);
        exporter.set_header_u32_for_test(&mut mem, OFF_SEGMENT_TABLE_NUM, 1);
        mem.write32(exporter_vaddr + 0x200, 0x5000); // segment 0 (TEXT) offset = A = 0x5000
        mem.write32(exporter_vaddr + 0x200 + 4, 0x100);
        mem.write32(exporter_vaddr + 0x200 + 8, 0); // SegmentId::Text

        exporter.set_header_u32_for_test(&mut mem, OFF_NAMED_EXPORT_TABLE_OFFSET, exporter_vaddr + 0x300);
        exporter.set_header_u32_for_test(&mut mem, OFF_NAMED_EXPORT_TABLE_NUM, 1);
        mem.write_slice(exporter_vaddr + 0x400, b"foo\0");
        mem.write32(exporter_vaddr + 0x300, exporter_vaddr + 0x400); // name_offset
        mem.write32(exporter_vaddr + 0x300 + 4, pack_segment_tag(0, 0)); // segment_tag -> TEXT segment 0, +0

        register(&mut mem, crs_vaddr, exporter_vaddr, true);

        // Importer: one named import "foo" at relocation offset R, addend D.
        let importer_vaddr = 0x800;
        let importer = make_cro(&mut mem, importer_vaddr);
        importer.set_header_u32_for_test(&mut mem, OFF_SEGMENT_TABLE_OFFSET, importer_vaddr + 0x200);
        importer.set_header_u32_for_test(&mut mem, OFF_SEGMENT_TABLE_NUM, 0);
        importer.set_header_u32_for_test(&mut mem, OFF_NAMED_IMPORT_TABLE_OFFSET, importer_vaddr + 0x300);
        importer.set_header_u32_for_test(&mut mem, OFF_NAMED_IMPORT_TABLE_NUM, 1);
        importer.set_header_u32_for_test(&mut mem, OFF_IMPORT_STRINGS_SIZE, 16);
        importer.set_header_u32_for_test(&mut mem, OFF_IMPORT_MODULE_TABLE_NUM, 0);
        importer.set_header_u32_for_test(&mut mem, OFF_ANONYMOUS_IMPORT_TABLE_NUM, 0);
        importer.set_header_u32_for_test(&mut mem, OFF_DATA_OFFSET, 0);

        mem.write_slice(importer_vaddr + 0x400, b"foo\0");
        let relocation_offset = importer_vaddr + 0x500;
        mem.write32(importer_vaddr + 0x300, importer_vaddr + 0x400); // name_offset
        mem.write32(importer_vaddr + 0x300 + 4, relocation_offset);

        // Relocation record at R: segment_tag referencing the importer's
        // own RODATA segment (here left at offset 0, so target == R itself
        // isn't meaningful -- point target at a scratch word instead).
        let target_scratch = importer_vaddr + 0x600;
        importer.set_header_u32_for_test(&mut mem, OFF_SEGMENT_TABLE_OFFSET, importer_vaddr + 0x200);
        importer.set_header_u32_for_test(&mut mem, OFF_SEGMENT_TABLE_NUM, 1);
        mem.write32(importer_vaddr + 0x200, target_scratch); // segment 0 offset == target_scratch
        mem.write32(importer_vaddr + 0x200 + 4, 0x10);
        mem.write32(importer_vaddr + 0x200 + 8, 1); // SegmentId::Rodata

        let addend: i32 = 0x20;
        mem.write32(relocation_offset, pack_segment_tag(0, 0)); // segment_tag: byte_offset 0, segment 0
        mem.write8(relocation_offset + 4, PATCH_TYPE_ABSOLUTE_ADDRESS);
        mem.write8(relocation_offset + 5, 0); // unused here
        mem.write8(relocation_offset + 6, 0); // is_resolved
        mem.write8(relocation_offset + 7, 1); // is_last_entry
        mem.write32(relocation_offset + 8, addend as u32);

        link(&mut mem, &importer, crs_vaddr).unwrap();

        assert_eq!(mem.read32(target_scratch), 0x5000u32.wrapping_add(addend as u32));
        assert_eq!(mem.read8(relocation_offset + 6), 1);
    }

    #[test]
    fn named_import_into_data_segment_patches_at_data_offset_and_restores_segment_table() {
        let mut mem = FlatMemory::new(0x2000);
        let crs_vaddr = 0x10u32;
        make_cro(&mut mem, crs_vaddr);

        let exporter_vaddr = 0x100;
        let exporter = make_cro(&mut mem, exporter_vaddr);
        exporter.set_header_u32_for_test(&mut mem, OFF_SEGMENT_TABLE_OFFSET, exporter_vaddr + 0x200);
        exporter.set_header_u32_for_test(&mut mem, OFF_SEGMENT_TABLE_NUM, 1);
        mem.write32(exporter_vaddr + 0x200, 0x5000);
        mem.write32(exporter_vaddr + 0x200 + 4, 0x100);
        mem.write32(exporter_vaddr + 0x200 + 8, 0); // SegmentId::Text

        exporter.set_header_u32_for_test(&mut mem, OFF_NAMED_EXPORT_TABLE_OFFSET, exporter_vaddr + 0x300);
        exporter.set_header_u32_for_test(&mut mem, OFF_NAMED_EXPORT_TABLE_NUM, 1);
        mem.write_slice(exporter_vaddr + 0x400, b"foo\0");
        mem.write32(exporter_vaddr + 0x300, exporter_vaddr + 0x400);
        mem.write32(exporter_vaddr + 0x300 + 4, pack_segment_tag(0, 0));

        register(&mut mem, crs_vaddr, exporter_vaddr, true);

        let importer_vaddr = 0x800;
        let importer = make_cro(&mut mem, importer_vaddr);
        importer.set_header_u32_for_test(&mut mem, OFF_NAMED_IMPORT_TABLE_OFFSET, importer_vaddr + 0x300);
        importer.set_header_u32_for_test(&mut mem, OFF_NAMED_IMPORT_TABLE_NUM, 1);
        importer.set_header_u32_for_test(&mut mem, OFF_IMPORT_STRINGS_SIZE, 16);
        importer.set_header_u32_for_test(&mut mem, OFF_IMPORT_MODULE_TABLE_NUM, 0);
        importer.set_header_u32_for_test(&mut mem, OFF_ANONYMOUS_IMPORT_TABLE_NUM, 0);

        mem.write_slice(importer_vaddr + 0x400, b"foo\0");
        let relocation_offset = importer_vaddr + 0x500;
        mem.write32(importer_vaddr + 0x300, importer_vaddr + 0x400);
        mem.write32(importer_vaddr + 0x300 + 4, relocation_offset);

        // Three segments so index 2 (.data, per ldr:ro's convention) is
        // populated. Its post-rebase offset (0x900) must NOT be where the
        // patch lands -- only `link`'s temporary data_offset override should.
        importer.set_header_u32_for_test(&mut mem, OFF_SEGMENT_TABLE_OFFSET, importer_vaddr + 0x200);
        importer.set_header_u32_for_test(&mut mem, OFF_SEGMENT_TABLE_NUM, 3);
        mem.write32(importer_vaddr + 0x200, importer_vaddr + 0x1000); // segment 0: TEXT
        mem.write32(importer_vaddr + 0x200 + 8, 0);
        mem.write32(importer_vaddr + 0x200 + 12, importer_vaddr + 0x1100); // segment 1: RODATA
        mem.write32(importer_vaddr + 0x200 + 20, 1);
        let post_rebase_data_offset = importer_vaddr + 0x900;
        mem.write32(importer_vaddr + 0x200 + 24, post_rebase_data_offset); // segment 2: DATA
        mem.write32(importer_vaddr + 0x200 + 32, 2);

        let data_offset_header = importer_vaddr + 0x700;
        importer.set_header_u32_for_test(&mut mem, OFF_DATA_OFFSET, data_offset_header);

        let byte_offset = 0x18u32;
        let addend: i32 = 4;
        mem.write32(relocation_offset, pack_segment_tag(byte_offset, 2));
        mem.write8(relocation_offset + 4, PATCH_TYPE_ABSOLUTE_ADDRESS);
        mem.write8(relocation_offset + 6, 0);
        mem.write8(relocation_offset + 7, 1);
        mem.write32(relocation_offset + 8, addend as u32);

        link(&mut mem, &importer, crs_vaddr).unwrap();

        assert_eq!(mem.read32(data_offset_header + byte_offset), 0x5000u32.wrapping_add(addend as u32));
        assert_eq!(mem.read32(importer.segment_table_offset(&mem) + 24), post_rebase_data_offset);
    }

    /// Test-only helper: the production code never needs to set header
    /// fields other than next/prev from outside `rebase`.
    impl CroModuleView {
        fn set_header_u32_for_test(&self, mem: &mut dyn Memory, off: u32, value: u32) {
            mem.write32(self.vaddr + off, value);
        }
    }
}
