//! [`SharedResource`] for D3D11 textures via `IDXGIKeyedMutex`.

use std::time::Duration;

use tracing::{error, warn};
use windows::core::Interface;
use windows::Win32::Foundation::{WAIT_ABANDONED, WAIT_TIMEOUT};
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Texture2D, D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX, D3D11_TEXTURE2D_DESC,
};
use windows::Win32::Graphics::Dxgi::IDXGIKeyedMutex;

use crate::{SharedResource, WaitStatus};

/// Whether `texture` was created with `D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX`.
pub fn is_keyed_texture(texture: &ID3D11Texture2D) -> bool {
    let mut desc = D3D11_TEXTURE2D_DESC::default();
    unsafe { texture.GetDesc(&mut desc) };
    desc.MiscFlags & D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX.0 as u32 != 0
}

fn keyed_mutex(texture: &ID3D11Texture2D) -> Option<IDXGIKeyedMutex> {
    match texture.cast::<IDXGIKeyedMutex>() {
        Ok(mutex) => Some(mutex),
        Err(e) => {
            error!("IDXGIKeyedMutex query failed: {e}");
            None
        }
    }
}

impl SharedResource for ID3D11Texture2D {
    fn has_keyed_mutex(&self) -> bool {
        is_keyed_texture(self)
    }

    fn acquire_key(&self, key: u64, timeout: Duration) -> WaitStatus {
        let Some(mutex) = keyed_mutex(self) else {
            return WaitStatus::Failed;
        };
        let millis = timeout.as_millis().min(u32::MAX as u128) as u32;

        // AcquireSync reports WAIT_ABANDONED and WAIT_TIMEOUT as success
        // HRESULTs, which the windows crate folds into Ok(()). Go through the
        // vtable to keep the raw code.
        let hr = unsafe {
            (Interface::vtable(&mutex).AcquireSync)(Interface::as_raw(&mutex), key, millis)
        };
        match hr.0 as u32 {
            0 => WaitStatus::Signaled,
            code if code == WAIT_ABANDONED.0 => WaitStatus::Abandoned,
            code if code == WAIT_TIMEOUT.0 => WaitStatus::Timeout,
            code => {
                warn!("AcquireSync failed: 0x{code:08X}");
                WaitStatus::Failed
            }
        }
    }

    fn release_key(&self, key: u64) -> bool {
        let Some(mutex) = keyed_mutex(self) else {
            return false;
        };
        match unsafe { mutex.ReleaseSync(key) } {
            Ok(()) => true,
            Err(e) => {
                warn!("ReleaseSync failed: {e}");
                false
            }
        }
    }
}
