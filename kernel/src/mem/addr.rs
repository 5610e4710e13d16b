// kernel/src/mem/addr.rs
//
// 役割:
// - 物理アドレス / 仮想アドレス / フレーム / ページなど、メモリ関連の基本型を定義する。
// - 2 段ページテーブル（ページディレクトリ + ページテーブル）の index 計算もここに置く。
// やること:
// - u64 の生アドレス値に対して、「これは物理アドレス」「これは仮想ページ」と区別できるようにする。
// やらないこと:
// - ページテーブルの中身を触る処理は書かない（それは address_space 側で行う）。

use core::fmt;

/// 物理アドレス（バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(pub u64);

/// 仮想アドレス（バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(pub u64);

/// ページサイズ（4KiB 固定）
pub const PAGE_SIZE: u64 = 4096;

/// ページ内 offset のビット数
pub const PAGE_SHIFT: u64 = 12;

/// ページディレクトリ index のシフト量（1 エントリ = 4MiB）
pub const PDX_SHIFT: u64 = 22;

/// ページディレクトリ / ページテーブル 1 枚あたりのエントリ数
pub const ENTRIES_PER_TABLE: usize = 1024;

/// ディレクトリ 1 エントリがカバーする仮想アドレス範囲（4MiB）
pub const PT_SPAN: u64 = PAGE_SIZE * ENTRIES_PER_TABLE as u64;

/// 物理フレーム（4KiB ごとの番号）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysFrame {
    pub number: u64, // frame index = phys_addr / PAGE_SIZE
}

/// 仮想ページ（4KiB ごとの番号）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtPage {
    pub number: u64, // page index = virt_addr / PAGE_SIZE
}

impl PhysAddr {
    /// 下位ビットを切り捨てて、ページ境界に揃える。
    pub fn align_down(self) -> PhysAddr {
        PhysAddr(self.0 & !(PAGE_SIZE - 1))
    }

    /// このアドレスが含まれる物理フレームを返す。
    pub fn frame(self) -> PhysFrame {
        PhysFrame {
            number: self.0 / PAGE_SIZE,
        }
    }
}

impl VirtAddr {
    /// 下位ビットを切り捨てて、ページ境界に揃える。
    pub const fn align_down(self) -> VirtAddr {
        VirtAddr(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// ページ先頭からの offset
    pub const fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE - 1)) as usize
    }

    /// このアドレスが含まれる仮想ページを返す。
    pub const fn page(self) -> VirtPage {
        VirtPage {
            number: self.0 / PAGE_SIZE,
        }
    }

    /// ページディレクトリ index（bits 31..22）
    pub const fn pdx(self) -> usize {
        ((self.0 >> PDX_SHIFT) as usize) & (ENTRIES_PER_TABLE - 1)
    }

    /// ページテーブル index（bits 21..12）
    pub const fn ptx(self) -> usize {
        ((self.0 >> PAGE_SHIFT) as usize) & (ENTRIES_PER_TABLE - 1)
    }

    pub const fn add(self, bytes: u64) -> VirtAddr {
        VirtAddr(self.0 + bytes)
    }
}

impl PhysFrame {
    /// フレーム先頭の物理アドレスを返す。
    pub fn start_address(self) -> PhysAddr {
        PhysAddr(self.number * PAGE_SIZE)
    }

    /// インデックスから直接フレームを作る（テスト用途など）。
    pub const fn from_index(number: u64) -> Self {
        PhysFrame { number }
    }
}

impl VirtPage {
    /// ページ先頭の仮想アドレスを返す。
    pub const fn start_address(self) -> VirtAddr {
        VirtAddr(self.number * PAGE_SIZE)
    }

    /// インデックスから直接仮想ページを作る。
    pub const fn from_index(number: u64) -> Self {
        VirtPage { number }
    }

    /// このページを含むディレクトリエントリの index
    pub const fn pdx(self) -> usize {
        self.start_address().pdx()
    }

    pub const fn ptx(self) -> usize {
        self.start_address().ptx()
    }

    pub const fn next(self) -> VirtPage {
        VirtPage {
            number: self.number + 1,
        }
    }
}

// --- Debug 実装（ログで見やすくするため） ---

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // フレーム先頭の物理アドレスを表示
        write!(f, "PhysFrame({:#x})", self.start_address().0)
    }
}

impl fmt::Debug for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ページ先頭の仮想アドレスを表示
        write!(f, "VirtPage({:#x})", self.start_address().0)
    }
}
