// kernel/src/kernel/user_program.rs
//
// user program のロード
// - ProgramImage（text / data / bss）から最初の env を作る。
// - text は P|U（読み取り専用）で USER_TEXT から、data と bss は P|U|W でその直後に置く。
// - 通常スタックは USER_STACK_TOP の直下 1 ページ（P|U|W）。
// - 例外スタックや upcall は用意しない（ユーザライブラリの仕事）。

use super::KernelState;
use crate::abi::KernelError;
use crate::mem::addr::{VirtAddr, PAGE_SIZE};
use crate::mem::layout::{USER_STACK_TOP, USER_TEXT};
use crate::mem::paging::PteFlags;
use crate::types::{EnvId, EnvStatus};

/// env にロードするプログラムの中身
#[derive(Clone, Copy, Debug)]
pub struct ProgramImage<'a> {
    pub text: &'a [u8],
    pub data: &'a [u8],
    pub bss_pages: usize,
    pub entry: u64,
}

impl<'a> ProgramImage<'a> {
    pub const fn new(text: &'a [u8]) -> Self {
        ProgramImage {
            text,
            data: &[],
            bss_pages: 0,
            entry: USER_TEXT.0,
        }
    }

    pub const fn with_data(mut self, data: &'a [u8]) -> Self {
        self.data = data;
        self
    }

    pub const fn with_bss_pages(mut self, pages: usize) -> Self {
        self.bss_pages = pages;
        self
    }

    fn text_pages(&self) -> usize {
        pages_for(self.text.len()).max(1)
    }

    /// data 領域の先頭（text の直後のページ）
    pub fn data_va(&self) -> VirtAddr {
        USER_TEXT.add(self.text_pages() as u64 * PAGE_SIZE)
    }

    /// bss 領域の先頭
    pub fn bss_va(&self) -> VirtAddr {
        self.data_va().add(pages_for(self.data.len()) as u64 * PAGE_SIZE)
    }
}

fn pages_for(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE as usize)
}

impl KernelState {
    /// プログラムをロードした env を作り、Runnable にする（親なし）
    pub fn create_env(&mut self, image: &ProgramImage<'_>) -> Result<EnvId, KernelError> {
        let idx = self.alloc_env(None)?;
        let id = self.envs[idx].id;

        if let Err(e) = self.load_image(idx, image) {
            self.destroy_env(id);
            return Err(e);
        }

        let env = &mut self.envs[idx];
        env.tf.eip = image.entry;
        env.tf.esp = USER_STACK_TOP.0 - 16;
        self.set_status(idx, EnvStatus::Runnable);

        crate::logging::info_fmt(format_args!(
            "create_env: [{}] mappings={}",
            id,
            self.envs[idx].address_space.mapping_count()
        ));
        Ok(id)
    }

    fn load_image(&mut self, idx: usize, image: &ProgramImage<'_>) -> Result<(), KernelError> {
        let ro = PteFlags::USER_PRESENT;
        let rw = PteFlags::USER_PRESENT | PteFlags::WRITABLE;

        self.load_segment(idx, USER_TEXT, image.text, image.text_pages(), ro)?;
        let data_pages = pages_for(image.data.len());
        self.load_segment(idx, image.data_va(), image.data, data_pages, rw)?;
        self.load_segment(idx, image.bss_va(), &[], image.bss_pages, rw)?;
        self.load_segment(idx, VirtAddr(USER_STACK_TOP.0 - PAGE_SIZE), &[], 1, rw)?;
        Ok(())
    }

    fn load_segment(
        &mut self,
        idx: usize,
        start: VirtAddr,
        bytes: &[u8],
        pages: usize,
        flags: PteFlags,
    ) -> Result<(), KernelError> {
        let mut page = start.page();
        for i in 0..pages {
            let frame = self.allocate_zeroed_frame()?;
            let off = i * PAGE_SIZE as usize;
            if off < bytes.len() {
                let end = bytes.len().min(off + PAGE_SIZE as usize);
                if let Some(data) = self.phys_mem.data_mut(frame) {
                    data[..end - off].copy_from_slice(&bytes[off..end]);
                }
            }
            self.map_frame(idx, page, frame, flags);
            page = page.next();
        }
        Ok(())
    }
}
