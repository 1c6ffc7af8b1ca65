//! Minimal D3D11 device wrapper for creating shared textures.
//!
//! Production senders and receivers bring their own device from the host.
//! This wrapper exists for tools and tests that need a real shared texture,
//! with or without a keyed mutex, to exercise cross-process access.

use anyhow::{anyhow, Result};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use tracing::{debug, error};

/// A D3D11 device with its immediate context.
///
/// Created via [`Dx11Device::new()`] which tries hardware acceleration first
/// and falls back to WARP.
pub struct Dx11Device {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
}

impl Dx11Device {
    /// Create a new D3D11 device using hardware acceleration, falling back to
    /// WARP if hardware is unavailable (e.g. CI/headless environments).
    ///
    /// Returns `None` if D3D11 is unavailable with any driver type.
    pub fn new() -> Option<Self> {
        let mut device = None;
        let mut context = None;

        // Try HARDWARE first, fall back to WARP for CI/headless
        let driver_types = [D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_WARP];
        let mut created = false;

        for &driver_type in &driver_types {
            let hr = unsafe {
                D3D11CreateDevice(
                    None,
                    driver_type,
                    HMODULE::default(),
                    D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                    Some(&[D3D_FEATURE_LEVEL_11_0]),
                    D3D11_SDK_VERSION,
                    Some(&mut device as *mut _),
                    None,
                    Some(&mut context as *mut _),
                )
            };
            if hr.is_ok() {
                debug!("D3D11 device created with driver type {:?}", driver_type);
                created = true;
                break;
            }
        }

        if !created {
            error!("Failed to create D3D11 device with any driver type");
            return None;
        }

        Some(Self {
            device: device?,
            context: context?,
        })
    }

    /// Borrow the underlying `ID3D11Device`.
    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }

    /// Borrow the immediate device context.
    pub fn context(&self) -> &ID3D11DeviceContext {
        &self.context
    }

    /// Create a BGRA texture that other processes can open.
    ///
    /// With `keyed` set the texture carries a DXGI keyed mutex
    /// (`D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX`); otherwise it is a plain
    /// shared texture (`D3D11_RESOURCE_MISC_SHARED`) whose access has to be
    /// arbitrated by a named lock.
    pub fn create_shared_texture(
        &self,
        width: u32,
        height: u32,
        keyed: bool,
    ) -> Result<ID3D11Texture2D> {
        let misc = if keyed {
            D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX
        } else {
            D3D11_RESOURCE_MISC_SHARED
        };
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_SHADER_RESOURCE.0 | D3D11_BIND_RENDER_TARGET.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: misc.0 as u32,
        };

        let mut texture = None;
        unsafe {
            self.device
                .CreateTexture2D(&desc, None, Some(&mut texture as *mut _))
        }
        .map_err(|e| anyhow!("CreateTexture2D {width}x{height} (keyed: {keyed}) failed: {e}"))?;

        let texture =
            texture.ok_or_else(|| anyhow!("CreateTexture2D returned no texture"))?;
        debug!("Shared texture created {width}x{height} (keyed: {keyed})");
        Ok(texture)
    }
}
