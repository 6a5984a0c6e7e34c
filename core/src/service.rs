//! LDR-RO service front-end: dispatches IPC requests onto the linker.
//!
//! A request buffer is little-endian 32-bit words: word 0 is the command
//! id, the rest are arguments in command-table order. The reply is
//! written back into the same buffer: word 0 a response header, word 1
//! the result code. On fault, nothing is written and the fault
//! propagates to the caller.

use crate::error::LinkerFault;
use crate::linker::module::CroModuleView;
use crate::linker::ops;
use crate::memory::Memory;

pub const INITIALIZE: u32 = 0x000100C2;
pub const LOAD_CRR: u32 = 0x00020082;
pub const LOAD_CRO_NEW: u32 = 0x000902C2;

/// Owns the head of the live-module list; exactly one per process.
pub struct LdrRoService {
    loaded_crs: Option<u32>,
}

impl LdrRoService {
    pub fn new() -> Self {
        LdrRoService { loaded_crs: None }
    }

    /// Dispatch one request sitting at `buffer_addr` in `mem`. `args` are
    /// the request's word-1-onward arguments, already read out of the
    /// buffer by the caller's IPC transport.
    pub fn handle_request(&mut self, mem: &mut dyn Memory, buffer_addr: u32, command: u32, args: &[u32]) -> Result<(), LinkerFault> {
        match command {
            INITIALIZE => {
                self.initialize(mem, args)?;
                write_reply(mem, buffer_addr, 0x1, 1, &[]);
            }
            LOAD_CRR => {
                self.load_crr(args)?;
                write_reply(mem, buffer_addr, 0x2, 1, &[]);
            }
            LOAD_CRO_NEW => {
                let size = args[2];
                self.load_cro_new(mem, args)?;
                write_reply(mem, buffer_addr, 0x9, 2, &[size]);
            }
            _ => return Err(LinkerFault::UnknownCommand(command)),
        }
        Ok(())
    }

    fn initialize(&mut self, mem: &mut dyn Memory, args: &[u32]) -> Result<(), LinkerFault> {
        let (crs_ptr, size, map_vaddr, _process_handle) = (args[0], args[1], args[2], args[3]);
        check_request(mem, crs_ptr, size)?;
        if self.loaded_crs.is_some() {
            return Err(LinkerFault::AlreadyLoaded);
        }

        mem.mirror_mapping(map_vaddr, crs_ptr, size);
        let view = CroModuleView::new(map_vaddr);
        ops::load(mem, &view)?;
        ops::rebase(mem, &view, map_vaddr, 0, 0, true, map_vaddr)?;

        self.loaded_crs = Some(map_vaddr);
        Ok(())
    }

    fn load_crr(&mut self, args: &[u32]) -> Result<(), LinkerFault> {
        let (_crr_ptr, _size, _process_handle) = (args[0], args[1], args[2]);
        // Signature verification is not implemented; acknowledge only.
        Ok(())
    }

    fn load_cro_new(&mut self, mem: &mut dyn Memory, args: &[u32]) -> Result<(), LinkerFault> {
        let crs_vaddr = self.loaded_crs.ok_or(LinkerFault::CrsNotLoaded)?;
        let (cro_ptr, map_vaddr, size, data_vaddr, _data_size, bss_vaddr, _bss_size, auto_link, fix_level, _process_handle) = (
            args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7] != 0, args[8], args[9],
        );
        check_request(mem, cro_ptr, size)?;
        if fix_level != 0 {
            log::warn!("{}", crate::error::LinkerWarning::FixLevelIgnored(fix_level));
        }

        mem.mirror_mapping(map_vaddr, cro_ptr, size);
        let view = CroModuleView::new(map_vaddr);
        ops::load(mem, &view)?;
        ops::rebase(mem, &view, map_vaddr, data_vaddr, bss_vaddr, false, crs_vaddr)?;
        ops::link(mem, &view, crs_vaddr)?;
        ops::register(mem, crs_vaddr, map_vaddr, auto_link);
        Ok(())
    }
}

impl Default for LdrRoService {
    fn default() -> Self {
        LdrRoService::new()
    }
}

fn check_request(mem: &dyn Memory, addr: u32, size: u32) -> Result<(), LinkerFault> {
    let mask = mem.page_mask();
    if addr & mask != 0 || size & mask != 0 || size < crate::linker::format::HEADER_SIZE {
        return Err(LinkerFault::UnalignedRequest);
    }
    Ok(())
}

/// Write a success reply: word 0 is the IPC response header packing
/// `(id << 16) | (normal_params << 6) | translate_params`, word 1 the
/// result code (`0` = success), and any trailing normal-param words after
/// that.
fn write_reply(mem: &mut dyn Memory, buffer_addr: u32, id: u32, normal_params: u32, extra_words: &[u32]) {
    let header = (id << 16) | (normal_params << 6);
    mem.write32(buffer_addr, header);
    mem.write32(buffer_addr + 4, 0);
    for (i, &word) in extra_words.iter().enumerate() {
        mem.write32(buffer_addr + 8 + i as u32 * 4, word);
    }
}
