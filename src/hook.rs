//! Mid-function hooks and the registry owning them.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use smallvec::SmallVec;
use tracing::debug;

use crate::context::HookContext;
use crate::error::{Error, Result};
use crate::memory::CodeMemory;
use crate::x86::{self, MidHookStub, RelocationPlan, JUMP_LEN, MAX_WINDOW};

/// Called with the registers at the hooked address and the data given at installation.
///
/// Runs on whichever host thread reaches the hook. It must not block, allocate, or panic;
/// reading and writing memory through the context is all it is expected to do.
pub type HookCallback<D> = unsafe fn(&mut HookContext, &D);

/// Everything needed to install one hook.
pub struct MidHookRequest<D> {
    pub address: usize,
    /// What the callback touches, e.g. "writes f32 [esp + 0xc]". Logged and kept in the
    /// `HookSite`.
    pub description: &'static str,
    pub data: D,
    pub callback: HookCallback<D>,
}

struct HookThunkData<D> {
    callback: HookCallback<D>,
    data: D,
}

extern "C" fn mid_hook_thunk<D>(context: *mut HookContext, data: *const HookThunkData<D>) {
    unsafe {
        let data = &*data;
        (data.callback)(&mut *context, &data.data);
    }
}

/// Address the stub calls for hooks carrying `D`.
fn thunk_address<D>() -> usize {
    mid_hook_thunk::<D> as *const () as usize
}

/// An installed hook.
pub struct HookSite {
    address: usize,
    original: SmallVec<[u8; 32]>,
    stub: usize,
    trampoline: usize,
    description: &'static str,
    // Referenced by the stub code, must live as long as the stub.
    payload: Box<dyn Any + Send + Sync>,
}

impl HookSite {
    pub fn address(&self) -> usize {
        self.address
    }

    /// Bytes replaced by the jump, which are also the length of the patch.
    pub fn original_bytes(&self) -> &[u8] {
        &self.original
    }

    pub fn len(&self) -> usize {
        self.original.len()
    }

    pub fn stub(&self) -> usize {
        self.stub
    }

    /// Address of the relocated original instructions inside the stub.
    pub fn trampoline(&self) -> usize {
        self.trampoline
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    fn overlaps(&self, address: usize, len: usize) -> bool {
        self.address < address + len && address < self.address + self.len()
    }
}

impl fmt::Debug for HookSite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HookSite")
            .field("address", &format_args!("{:#x}", self.address))
            .field("len", &self.original.len())
            .field("stub", &format_args!("{:#x}", self.stub))
            .field("description", &self.description)
            .finish()
    }
}

/// Owns every installed hook. At most one hook occupies any byte of code.
pub struct HookRegistry<M: CodeMemory> {
    memory: M,
    sites: BTreeMap<usize, HookSite>,
    // Stubs of uninstalled hooks; a thread may still be returning through them.
    _retired: Vec<Box<dyn Any + Send + Sync>>,
}

impl<M: CodeMemory> HookRegistry<M> {
    pub fn new(memory: M) -> HookRegistry<M> {
        HookRegistry {
            memory,
            sites: BTreeMap::new(),
            _retired: Vec::new(),
        }
    }

    fn overlapping(&self, address: usize, len: usize) -> Option<usize> {
        let before = self.sites.range(..=address).next_back();
        let after = self.sites.range(address..).take_while(|&(&a, _)| a < address + len);
        before
            .into_iter()
            .chain(after)
            .find(|(_, site)| site.overlaps(address, len))
            .map(|(&a, _)| a)
    }

    /// Installs a hook at `request.address`.
    ///
    /// On error the code and the registry are left as they were.
    pub fn install<D>(&mut self, request: MidHookRequest<D>) -> Result<&HookSite>
    where D: Send + Sync + 'static,
    {
        let MidHookRequest { address, description, data, callback } = request;
        if address == 0 {
            return Err(Error::InvalidAddress(address));
        }
        if self.sites.contains_key(&address) {
            return Err(Error::AlreadyHooked(address));
        }
        if let Some(existing) = self.overlapping(address, 1) {
            return Err(Error::OverlappingHook { address, existing });
        }

        let mut window = [0u8; MAX_WINDOW];
        let available = self.memory.read(address, &mut window)?;
        let plan = RelocationPlan::new(address, &window[..available], JUMP_LEN)?;
        if let Some(existing) = self.overlapping(address, plan.source_len()) {
            return Err(Error::OverlappingHook { address, existing });
        }

        let payload = Box::new(HookThunkData {
            callback,
            data,
        });
        let payload_address = &*payload as *const HookThunkData<D> as usize;
        let thunk = thunk_address::<D>();
        let stub = MidHookStub::new(&plan, thunk, payload_address);
        let stub_address = self.memory.allocate_stub(stub.len())?;
        let trampoline = stub.relocated_address(stub_address);
        let code = stub.assemble(stub_address);
        if let Err(e) = self.memory.write_stub(stub_address, &code) {
            self.memory.release_stub(stub_address);
            return Err(e);
        }
        let patch = x86::jump_patch(address, stub_address, plan.source_len());
        let result = self.memory.patch_code(address, &patch, &|ip| plan.map_ip(ip, trampoline));
        if let Err(e) = result {
            self.memory.release_stub(stub_address);
            return Err(e);
        }
        debug!(
            "Hook @ {:#x} ({} bytes) -> stub {:#x}, {}",
            address, plan.source_len(), stub_address, description,
        );

        let site = HookSite {
            address,
            original: plan.original_bytes().iter().cloned().collect(),
            stub: stub_address,
            trampoline,
            description,
            payload,
        };
        let site = self.sites.entry(address).or_insert(site);
        Ok(&*site)
    }

    /// Writes the original bytes back.
    ///
    /// The stub is not freed, as a thread may be executing it.
    ///
    /// # Safety
    /// No other code may have modified the hooked bytes since installation.
    pub unsafe fn uninstall(&mut self, address: usize) -> Result<()> {
        let site = self.sites.remove(&address).ok_or(Error::NotHooked(address))?;
        let trampoline = site.trampoline;
        let end = address + site.len();
        // Threads in the relocated copy are left to finish there; one about to enter
        // the jump stays where it is.
        let result = self.memory.patch_code(address, &site.original, &|ip| {
            if ip > address && ip < end {
                None
            } else {
                Some(ip)
            }
        });
        match result {
            Ok(()) => {
                debug!("Unhooked @ {:#x}, trampoline {:#x} retired", address, trampoline);
                self._retired.push(site.payload);
                Ok(())
            }
            Err(e) => {
                self.sites.insert(address, site);
                Err(e)
            }
        }
    }

    pub fn site(&self, address: usize) -> Option<&HookSite> {
        self.sites.get(&address)
    }

    pub fn is_hooked(&self, address: usize) -> bool {
        self.sites.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Installed hooks in address order.
    pub fn sites(&self) -> impl Iterator<Item = &HookSite> {
        self.sites.values()
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }
}
