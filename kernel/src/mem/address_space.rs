// kernel/src/mem/address_space.rs
//
// 役割:
// - 1 つの env のユーザアドレス空間を表現する。
// - どの仮想ページがどの物理フレームにどの権限でマップされているかを、
//   2 段（ページディレクトリ → ページテーブル）の構造で保持する。
//
// 設計方針:
// - ディレクトリエントリは「ページテーブルが存在すれば present」。
//   一度作ったテーブルは空になっても残す（ビューの vpd が揺れないように）。
// - Map は既存マッピングを置き換え、古いエントリを返す（参照カウントは呼び出し側の責務）。
// - Unmap は未マップでも成功扱い（外したエントリがあれば返す）。
//
// やらないこと:
// - 物理フレームの確保・解放（mm 側）
// - 権限チェック（syscall 側）

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::mem::addr::{VirtPage, ENTRIES_PER_TABLE};
use crate::mem::paging::{MemAction, Pte, PteFlags};

/// ディレクトリエントリが present のときに見せる属性
const PDE_FLAGS: PteFlags = PteFlags::from_bits_retain(
    PteFlags::PRESENT.bits() | PteFlags::WRITABLE.bits() | PteFlags::USER.bits(),
);

struct PageTable {
    entries: [Pte; ENTRIES_PER_TABLE],
}

impl PageTable {
    fn new() -> Box<Self> {
        Box::new(PageTable {
            entries: [Pte::empty(); ENTRIES_PER_TABLE],
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub page: VirtPage,
    pub pte: Pte,
}

pub struct AddressSpace {
    directory: Vec<Option<Box<PageTable>>>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        let mut directory = Vec::with_capacity(ENTRIES_PER_TABLE);
        directory.resize_with(ENTRIES_PER_TABLE, || None);
        AddressSpace { directory }
    }

    /// ディレクトリエントリ（ページテーブルがあれば P|W|U）
    pub fn pde(&self, pdx: usize) -> Pte {
        match self.directory.get(pdx) {
            Some(Some(_)) => Pte(PDE_FLAGS.bits()),
            _ => Pte::empty(),
        }
    }

    /// ページテーブルエントリ（テーブルが無ければ空）
    pub fn pte(&self, page: VirtPage) -> Pte {
        match self.directory.get(page.pdx()) {
            Some(Some(table)) => table.entries[page.ptx()],
            _ => Pte::empty(),
        }
    }

    /// present なマッピングだけを返す
    pub fn lookup(&self, page: VirtPage) -> Option<Pte> {
        let pte = self.pte(page);
        pte.is_present().then_some(pte)
    }

    /// MemAction を適用し、置き換え/解除された古いエントリを返す。
    pub fn apply(&mut self, action: MemAction) -> Option<Pte> {
        match action {
            MemAction::Map { page, frame, flags } => {
                let table = self.directory[page.pdx()].get_or_insert_with(PageTable::new);
                let old = core::mem::replace(&mut table.entries[page.ptx()], Pte::new(frame, flags));
                old.is_present().then_some(old)
            }
            MemAction::Unmap { page } => {
                let table = self.directory[page.pdx()].as_mut()?;
                let old = core::mem::replace(&mut table.entries[page.ptx()], Pte::empty());
                old.is_present().then_some(old)
            }
        }
    }

    pub fn mapping_count(&self) -> usize {
        let mut n = 0;
        self.for_each_mapping(|_| n += 1);
        n
    }

    pub fn for_each_mapping<F>(&self, mut f: F)
    where
        F: FnMut(&Mapping),
    {
        for (pdx, slot) in self.directory.iter().enumerate() {
            let Some(table) = slot else { continue };
            for (ptx, pte) in table.entries.iter().enumerate() {
                if pte.is_present() {
                    let number = (pdx * ENTRIES_PER_TABLE + ptx) as u64;
                    f(&Mapping {
                        page: VirtPage::from_index(number),
                        pte: *pte,
                    });
                }
            }
        }
    }

    /// 全マッピングを外して返す（env 破棄用）
    pub fn clear(&mut self) -> Vec<Mapping> {
        let mut removed = Vec::new();
        self.for_each_mapping(|m| removed.push(*m));
        for slot in self.directory.iter_mut() {
            *slot = None;
        }
        removed
    }
}
