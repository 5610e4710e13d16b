// ufork/src/error.rs
//
// 役割:
// - fork / pgfault / duppage が返すエラーを 1 つの型にまとめる。
// - fatal 経路（診断を console に出して panic）もここに置く。
//
// エラーの 2 分類:
// - 契約違反: InvalidPage / BadFault / StackOutOfRange / NotImplemented
// - カーネルの拒否: Kernel（どの段階の、どの syscall が、どのコードで失敗したか）

use alloc::format;
use core::fmt;

use exokernel::abi::{KernelError, MemFault, PageFaultErrorCode, UserEnv};
use exokernel::mem::addr::{VirtAddr, VirtPage};
use exokernel::mem::paging::PteFlags;

/// fork の段階（この順にしか進まない）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ForkStage {
    HandlerInstalled,
    ChildSpawned,
    PagesDuplicated,
    StackCopied,
    ExceptionStackAllocated,
    UpcallRegistered,
    Activated,
}

impl fmt::Display for ForkStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForkStage::HandlerInstalled => "installing the fault handler",
            ForkStage::ChildSpawned => "creating the child",
            ForkStage::PagesDuplicated => "duplicating pages",
            ForkStage::StackCopied => "duplicating the stack",
            ForkStage::ExceptionStackAllocated => "allocating the child exception stack",
            ForkStage::UpcallRegistered => "registering the child upcall",
            ForkStage::Activated => "activating the child",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkError {
    /// syscall がカーネルに拒否された
    Kernel {
        stage: Option<ForkStage>,
        op: &'static str,
        err: KernelError,
    },
    /// user 領域の外のページを渡された
    InvalidPage(VirtPage),
    /// copy-on-write ページへの書き込み以外の fault
    BadFault {
        va: VirtAddr,
        eip: u64,
        err: PageFaultErrorCode,
        perm: PteFlags,
    },
    /// スタックポインタが fork で複製できる範囲にない
    StackOutOfRange(VirtAddr),
    /// fault 中のページの内容をコピーできなかった
    CopyFailed(MemFault),
    NotImplemented(&'static str),
}

pub type ForkResult<T> = Result<T, ForkError>;

impl ForkError {
    pub const fn kernel(op: &'static str, err: KernelError) -> Self {
        ForkError::Kernel {
            stage: None,
            op,
            err,
        }
    }

    /// カーネルエラーに fork の段階を付ける（他の種類はそのまま）
    pub fn at(self, stage: ForkStage) -> Self {
        match self {
            ForkError::Kernel { stage: None, op, err } => ForkError::Kernel {
                stage: Some(stage),
                op,
                err,
            },
            other => other,
        }
    }

    pub fn stage(&self) -> Option<ForkStage> {
        match self {
            ForkError::Kernel { stage, .. } => *stage,
            _ => None,
        }
    }
}

impl fmt::Display for ForkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkError::Kernel { stage: Some(stage), op, err } => {
                write!(f, "{}: {}: {}", stage, op, err)
            }
            ForkError::Kernel { stage: None, op, err } => write!(f, "{}: {}", op, err),
            ForkError::InvalidPage(page) => {
                write!(f, "page {} is not a user page", page.start_address())
            }
            ForkError::BadFault { va, eip, err, perm } => write!(
                f,
                "user fault va {} ip {:#010x} err {:#x} perm {:#x}: not a write to a copy-on-write page",
                va,
                eip,
                err.bits(),
                perm.bits()
            ),
            ForkError::StackOutOfRange(sp) => write!(f, "stack pointer {} outside user stack range", sp),
            ForkError::CopyFailed(fault) => write!(f, "page copy failed: {}", fault),
            ForkError::NotImplemented(what) => write!(f, "{} not implemented", what),
        }
    }
}

/// 診断を `[envid] what: err` の形で console に出してから panic する
pub(crate) fn fatal<E: UserEnv + ?Sized>(env: &mut E, what: &str, err: &ForkError) -> ! {
    let line = format!("[{}] {}: {}\n", env.sys_getenvid(), what, err);
    env.sys_cputs(&line);
    panic!("{}: {}", what, err);
}
