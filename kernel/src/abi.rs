// kernel/src/abi.rs
//
// 役割:
// - ユーザ env から見た「カーネルの契約」を 1 か所に集める。
//   - syscall（Syscalls）
//   - 自分のページテーブルの読み取り専用ビュー（PageTableView）
//   - 自分のアドレス空間へのメモリアクセスとスタックポインタ（UserMemory）
//   - page fault upcall に渡される fault 記録（UTrapframe）
//
// 設計方針:
// - トレイトはすべて object safe にする（upcall は &mut dyn UserEnv を受け取る）。
// - ビューには書き込み API を置かない（読み取り専用のケイパビリティとして扱う）。
// - エラーは固定の負の数値コードを持つ（診断メッセージに数値を出すため）。

use core::fmt;

pub use x86_64::structures::idt::PageFaultErrorCode;

use crate::mem::addr::{VirtAddr, VirtPage, PAGE_SIZE};
use crate::mem::paging::{Pte, PteFlags};
use crate::types::{EnvId, EnvStatus};

/// syscall がカーネルに拒否されたときの理由
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// env が存在しない、または操作する権限がない
    BadEnv,
    /// 引数が不正（アドレス境界・権限ビット・状態値など）
    Inval,
    /// 物理フレームが尽きた
    NoMem,
    /// env テーブルが満杯
    NoFreeEnv,
    /// メモリアクセス違反
    Fault,
}

impl KernelError {
    /// syscall の戻り値として使う負の数値コード
    pub const fn code(self) -> i32 {
        match self {
            KernelError::BadEnv => -2,
            KernelError::Inval => -3,
            KernelError::NoMem => -4,
            KernelError::NoFreeEnv => -5,
            KernelError::Fault => -6,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::BadEnv => "bad environment",
            KernelError::Inval => "invalid parameter",
            KernelError::NoMem => "out of memory",
            KernelError::NoFreeEnv => "out of environments",
            KernelError::Fault => "segmentation fault",
        };
        write!(f, "{} ({})", msg, self.code())
    }
}

/// page fault upcall に渡される fault 記録（1 回の fault につき 1 つ、読み取り専用）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UTrapframe {
    /// fault を起こした仮想アドレス
    pub fault_va: VirtAddr,
    /// fault 原因ビット（present / write / user）
    pub err: PageFaultErrorCode,
    /// fault を起こした命令のアドレス
    pub eip: u64,
    /// fault 時のスタックポインタ
    pub esp: u64,
}

impl UTrapframe {
    pub fn is_write(&self) -> bool {
        self.err.contains(PageFaultErrorCode::CAUSED_BY_WRITE)
    }
}

/// カーネルに登録する page fault upcall の入口
///
/// カーネルは fault を起こした env 自身のコンテキストで、例外スタック上からこれを呼ぶ。
#[derive(Clone, Copy)]
pub struct PgfaultUpcall(pub fn(&mut dyn UserEnv, &UTrapframe));

impl PgfaultUpcall {
    pub fn invoke(self, env: &mut dyn UserEnv, utf: &UTrapframe) {
        (self.0)(env, utf)
    }

    pub fn addr(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for PgfaultUpcall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PgfaultUpcall({:#x})", self.addr())
    }
}

/// trap 経路で解決できなかったユーザのメモリアクセス（env は破棄済み）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemFault {
    pub va: VirtAddr,
    pub err: PageFaultErrorCode,
}

impl fmt::Display for MemFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unhandled user fault va {} err {:#x}", self.va, self.err.bits())
    }
}

/// カーネル syscall（env 引数の EnvId(0) は呼び出し元自身）
pub trait Syscalls {
    fn sys_getenvid(&self) -> EnvId;

    /// 新しい env を作る。親には子の id、子には EnvId(0) が返る。
    /// 子のアドレス空間は空で、状態は NotRunnable。
    fn sys_exofork(&mut self) -> Result<EnvId, KernelError>;

    /// ゼロクリアした物理ページを env の va に perm で map する。
    fn sys_page_alloc(&mut self, env: EnvId, va: VirtAddr, perm: PteFlags) -> Result<(), KernelError>;

    /// src_env の src_va にあるページを dst_env の dst_va に perm で map する。
    fn sys_page_map(
        &mut self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), KernelError>;

    fn sys_page_unmap(&mut self, env: EnvId, va: VirtAddr) -> Result<(), KernelError>;

    fn sys_env_set_pgfault_upcall(&mut self, env: EnvId, upcall: PgfaultUpcall) -> Result<(), KernelError>;

    fn sys_env_set_status(&mut self, env: EnvId, status: EnvStatus) -> Result<(), KernelError>;

    fn sys_cputs(&mut self, s: &str);
}

/// 自分のページディレクトリ / ページテーブルの読み取り専用ビュー（syscall 不要）
pub trait PageTableView {
    /// ディレクトリエントリ（4MiB 単位）
    fn vpd(&self, pdx: usize) -> Pte;

    /// ページテーブルエントリ（ディレクトリが absent なら空）
    fn vpt(&self, page: VirtPage) -> Pte;

    /// ページが present ならその属性
    fn page_flags(&self, page: VirtPage) -> Option<PteFlags> {
        if !self.vpd(page.pdx()).is_present() {
            return None;
        }
        let pte = self.vpt(page);
        pte.is_present().then(|| pte.flags())
    }
}

/// 自分のアドレス空間へのアクセス
///
/// 権限違反は trap 経路（upcall）を通る。解決できなければ env は破棄され MemFault が返る。
pub trait UserMemory {
    fn read(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), MemFault>;

    fn write(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), MemFault>;

    fn stack_pointer(&self) -> VirtAddr;

    /// src を含むページ全体を dst を含むページへコピーする
    fn copy_page(&mut self, dst: VirtAddr, src: VirtAddr) -> Result<(), MemFault> {
        let mut buf = [0u8; PAGE_SIZE as usize];
        self.read(src.align_down(), &mut buf)?;
        self.write(dst.align_down(), &buf)
    }
}

/// upcall が受け取るユーザ env の全体像
pub trait UserEnv: Syscalls + PageTableView + UserMemory {}

impl<T: Syscalls + PageTableView + UserMemory + ?Sized> UserEnv for T {}
