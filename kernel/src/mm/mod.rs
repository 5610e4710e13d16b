// kernel/src/mm/mod.rs
//
// 物理メモリ管理の入り口。
// - 上限 max_frames 枚の物理フレームを管理し、確保時はゼロクリアして返す。
// - 各フレームは参照カウント（何個のマッピングから指されているか）を持ち、0 になったら解放する。
// - フレームの中身（4KiB）もここで保持する。ユーザのメモリアクセスは最終的にここに届く。
// - 状態は構造体 + カウンタに閉じ込める（検証しやすくするため）。

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::mem::addr::{PhysFrame, PAGE_SIZE};

const FRAME_BYTES: usize = PAGE_SIZE as usize;

struct FrameSlot {
    refcount: u32,
    data: Box<[u8; FRAME_BYTES]>,
}

/// カーネル側から見える「物理メモリマネージャ」。
/// - 外部 API はすべて safe にする。
/// - 解放されたフレームは free list に戻し、次の確保で再利用する。
pub struct PhysicalMemoryManager {
    slots: Vec<FrameSlot>,
    free: Vec<usize>,
    max_frames: usize,
}

impl PhysicalMemoryManager {
    pub fn new(max_frames: usize) -> Self {
        PhysicalMemoryManager {
            slots: Vec::new(),
            free: Vec::new(),
            max_frames,
        }
    }

    /// 物理フレームを 1 つ確保する（中身はゼロ、参照カウントは 0）。
    /// - これ以上確保できない: None
    pub fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if let Some(idx) = self.free.pop() {
            self.slots[idx].data.fill(0);
            return Some(PhysFrame::from_index(idx as u64));
        }
        if self.slots.len() >= self.max_frames {
            return None;
        }
        self.slots.push(FrameSlot {
            refcount: 0,
            data: Box::new([0u8; FRAME_BYTES]),
        });
        Some(PhysFrame::from_index((self.slots.len() - 1) as u64))
    }

    /// マッピングが 1 つ増えた
    pub fn incref(&mut self, frame: PhysFrame) {
        if let Some(slot) = self.slot_mut(frame) {
            slot.refcount += 1;
        }
    }

    /// マッピングが 1 つ減った。0 になったら free list に戻す。
    /// - 解放したら true
    pub fn decref(&mut self, frame: PhysFrame) -> bool {
        let idx = frame.number as usize;
        let Some(slot) = self.slots.get_mut(idx) else {
            return false;
        };
        if slot.refcount == 0 {
            return false;
        }
        slot.refcount -= 1;
        if slot.refcount == 0 {
            self.free.push(idx);
            return true;
        }
        false
    }

    pub fn refcount(&self, frame: PhysFrame) -> u32 {
        self.slots.get(frame.number as usize).map_or(0, |s| s.refcount)
    }

    /// 使用中（参照カウント > 0）のフレーム数
    pub fn frames_in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.refcount > 0).count()
    }

    pub fn data(&self, frame: PhysFrame) -> Option<&[u8; FRAME_BYTES]> {
        self.slots.get(frame.number as usize).map(|s| &*s.data)
    }

    pub fn data_mut(&mut self, frame: PhysFrame) -> Option<&mut [u8; FRAME_BYTES]> {
        self.slot_mut(frame).map(|s| &mut *s.data)
    }

    fn slot_mut(&mut self, frame: PhysFrame) -> Option<&mut FrameSlot> {
        self.slots.get_mut(frame.number as usize)
    }
}
