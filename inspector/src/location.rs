//! Locations in code, named either by bytecode or by machine address, that
//! fill in the other half lazily as the target learns more.

use std::fmt;

use parking_lot::Mutex;

use crate::address::Address;
use crate::error::InspectorError;
use crate::target::{MethodAccess, MethodKey, MethodRef};

// ── Lazy resolution ───────────────────────────────────────────────────

/// State of one lazily derived value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    /// Not attempted, or the target does not know the answer yet.
    Unresolved,
    Resolved(T),
    /// The last attempt hit a busy or unreadable target.
    RetryLater,
}

impl<T> Default for Resolution<T> {
    fn default() -> Self {
        Self::Unresolved
    }
}

impl<T: Clone> Resolution<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Self::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Take the outcome of one attempt. Once resolved the state never
    /// changes again; fatal errors are passed on and leave it untouched.
    pub fn record(
        &mut self,
        outcome: Result<Option<T>, InspectorError>,
    ) -> Result<Option<T>, InspectorError> {
        if let Self::Resolved(value) = self {
            return Ok(Some(value.clone()));
        }
        match outcome {
            Ok(Some(value)) => {
                *self = Self::Resolved(value.clone());
                Ok(Some(value))
            }
            Ok(None) => {
                *self = Self::Unresolved;
                Ok(None)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                log::trace!("location resolution deferred: {err}");
                *self = Self::RetryLater;
                Ok(None)
            }
        }
    }

    /// Run `resolve` unless already resolved.
    pub fn attempt(
        &mut self,
        resolve: impl FnOnce() -> Result<Option<T>, InspectorError>,
    ) -> Result<Option<T>, InspectorError> {
        if let Self::Resolved(value) = self {
            return Ok(Some(value.clone()));
        }
        self.record(resolve())
    }
}

// ── Resolver ──────────────────────────────────────────────────────────

/// The compiled method and bytecode index owning a machine address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineCodeOwner {
    pub method: MethodRef,
    pub bci: i32,
}

/// What a location may ask of the rest of the inspector. Every call may
/// need the target and must fail fast with `Busy` rather than wait.
pub trait LocationResolver {
    /// `None` while the holder class is not loaded.
    fn method_for_key(&self, key: &MethodKey) -> Result<Option<MethodRef>, InspectorError>;

    fn key_of(&self, method: MethodRef) -> Result<Option<MethodKey>, InspectorError>;

    /// `None` when no known compilation contains `address`.
    fn owner_of_code(&self, address: Address)
    -> Result<Option<MachineCodeOwner>, InspectorError>;

    /// Call entry point of the method's first compilation.
    fn first_call_entry(&self, method: MethodRef) -> Result<Option<Address>, InspectorError>;

    fn well_known_method(
        &self,
        access: &MethodAccess,
    ) -> Result<Option<MethodRef>, InspectorError>;
}

// ── Locations ─────────────────────────────────────────────────────────

/// A method and a bytecode index in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytecodeLocation {
    pub method: MethodRef,
    pub bci: i32,
}

/// What a location was created from. Never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    MethodKey(MethodKey),
    Bytecode { method: MethodRef, bci: i32 },
    Machine(Address),
    /// A machine address inside a compilation, with its bytecode already
    /// known.
    Compiled {
        method: MethodRef,
        bci: i32,
        address: Address,
    },
    MethodAccess(MethodAccess),
}

/// Which equivalence a location takes part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    /// Same as another bytecode location when the method keys match.
    Bytecode,
    /// Same as another machine location when the addresses match.
    Machine,
}

#[derive(Default)]
struct Derived {
    method: Resolution<MethodRef>,
    key: Resolution<MethodKey>,
    owner: Resolution<MachineCodeOwner>,
    address: Resolution<Address>,
}

pub struct CodeLocation {
    origin: Origin,
    description: String,
    derived: Mutex<Derived>,
}

impl fmt::Debug for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeLocation")
            .field("origin", &self.origin)
            .field("description", &self.description)
            .finish()
    }
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Origin::MethodKey(key) => write!(f, "{key}")?,
            Origin::Bytecode { method, bci } => write!(f, "{:?}@{bci}", method.0)?,
            Origin::Machine(address) => write!(f, "{address:?}")?,
            Origin::Compiled { method, bci, address } => {
                write!(f, "{address:?} ({:?}@{bci})", method.0)?
            }
            Origin::MethodAccess(access) => write!(f, "{access}")?,
        }
        if !self.description.is_empty() {
            write!(f, " \"{}\"", self.description)?;
        }
        Ok(())
    }
}

impl CodeLocation {
    fn new(origin: Origin, description: impl Into<String>) -> Self {
        Self {
            origin,
            description: description.into(),
            derived: Mutex::new(Derived::default()),
        }
    }

    pub fn for_key(key: MethodKey, description: impl Into<String>) -> Self {
        Self::new(Origin::MethodKey(key), description)
    }

    pub fn bytecode(method: MethodRef, bci: i32, description: impl Into<String>) -> Self {
        Self::new(Origin::Bytecode { method, bci }, description)
    }

    pub fn machine(address: Address, description: impl Into<String>) -> Self {
        Self::new(Origin::Machine(address), description)
    }

    pub fn compiled(
        method: MethodRef,
        bci: i32,
        address: Address,
        description: impl Into<String>,
    ) -> Self {
        Self::new(Origin::Compiled { method, bci, address }, description)
    }

    pub fn method_access(access: MethodAccess, description: impl Into<String>) -> Self {
        Self::new(Origin::MethodAccess(access), description)
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> LocationKind {
        match self.origin {
            Origin::MethodKey(_) | Origin::Bytecode { .. } => LocationKind::Bytecode,
            Origin::Machine(_) | Origin::Compiled { .. } | Origin::MethodAccess(_) => {
                LocationKind::Machine
            }
        }
    }

    /// Whether a machine address is part of the location or can be derived.
    pub fn has_address(&self) -> bool {
        matches!(
            self.origin,
            Origin::Machine(_) | Origin::Compiled { .. } | Origin::MethodAccess(_)
        )
    }

    fn resolve<T: Clone>(
        &self,
        slot: fn(&mut Derived) -> &mut Resolution<T>,
        resolve: impl FnOnce() -> Result<Option<T>, InspectorError>,
    ) -> Result<Option<T>, InspectorError> {
        if let Some(value) = slot(&mut self.derived.lock()).value() {
            return Ok(Some(value));
        }
        // Unlocked while resolving: resolvers may ask this location again.
        let outcome = resolve();
        slot(&mut self.derived.lock()).record(outcome)
    }

    fn owner(
        &self,
        address: Address,
        resolver: &dyn LocationResolver,
    ) -> Result<Option<MachineCodeOwner>, InspectorError> {
        self.resolve(|d| &mut d.owner, || resolver.owner_of_code(address))
    }

    pub fn method(
        &self,
        resolver: &dyn LocationResolver,
    ) -> Result<Option<MethodRef>, InspectorError> {
        match &self.origin {
            Origin::Bytecode { method, .. } | Origin::Compiled { method, .. } => {
                Ok(Some(*method))
            }
            Origin::MethodKey(key) => {
                self.resolve(|d| &mut d.method, || resolver.method_for_key(key))
            }
            Origin::Machine(address) => {
                Ok(self.owner(*address, resolver)?.map(|owner| owner.method))
            }
            Origin::MethodAccess(access) => {
                self.resolve(|d| &mut d.method, || resolver.well_known_method(access))
            }
        }
    }

    pub fn key(
        &self,
        resolver: &dyn LocationResolver,
    ) -> Result<Option<MethodKey>, InspectorError> {
        if let Origin::MethodKey(key) = &self.origin {
            return Ok(Some(key.clone()));
        }
        let Some(method) = self.method(resolver)? else {
            return Ok(None);
        };
        self.resolve(|d| &mut d.key, || resolver.key_of(method))
    }

    /// Bytecode index; 0 when only the method is known.
    pub fn bci(&self, resolver: &dyn LocationResolver) -> Result<Option<i32>, InspectorError> {
        match &self.origin {
            Origin::Bytecode { bci, .. } | Origin::Compiled { bci, .. } => Ok(Some(*bci)),
            Origin::Machine(address) => {
                Ok(self.owner(*address, resolver)?.map(|owner| owner.bci))
            }
            Origin::MethodKey(_) | Origin::MethodAccess(_) => {
                Ok(self.method(resolver)?.map(|_| 0))
            }
        }
    }

    /// Machine address. Bytecode locations never carry one.
    pub fn address(
        &self,
        resolver: &dyn LocationResolver,
    ) -> Result<Option<Address>, InspectorError> {
        match &self.origin {
            Origin::Machine(address) | Origin::Compiled { address, .. } => Ok(Some(*address)),
            Origin::MethodKey(_) | Origin::Bytecode { .. } => Ok(None),
            Origin::MethodAccess(_) => {
                let Some(method) = self.method(resolver)? else {
                    return Ok(None);
                };
                self.resolve(|d| &mut d.address, || resolver.first_call_entry(method))
            }
        }
    }

    pub fn bytecode_location(
        &self,
        resolver: &dyn LocationResolver,
    ) -> Result<Option<BytecodeLocation>, InspectorError> {
        let Some(method) = self.method(resolver)? else {
            return Ok(None);
        };
        let bci = self.bci(resolver)?.unwrap_or(0);
        Ok(Some(BytecodeLocation { method, bci }))
    }

    /// Bytecode locations match on method key alone, machine locations on
    /// address alone. A bytecode location is never the same as a machine
    /// one.
    pub fn is_same_as(
        &self,
        other: &CodeLocation,
        resolver: &dyn LocationResolver,
    ) -> Result<bool, InspectorError> {
        match (self.kind(), other.kind()) {
            (LocationKind::Bytecode, LocationKind::Bytecode) => {
                let (Some(a), Some(b)) = (self.key(resolver)?, other.key(resolver)?) else {
                    return Ok(false);
                };
                Ok(a == b)
            }
            (LocationKind::Machine, LocationKind::Machine) => {
                let (Some(a), Some(b)) = (self.address(resolver)?, other.address(resolver)?)
                else {
                    return Ok(false);
                };
                Ok(a == b)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    struct FakeResolver {
        methods: RefCell<HashMap<MethodKey, MethodRef>>,
        owners: HashMap<Address, MachineCodeOwner>,
        entries: HashMap<MethodRef, Address>,
        well_known: HashMap<MethodAccess, MethodRef>,
        busy: Cell<bool>,
        fatal: Cell<bool>,
        calls: Cell<usize>,
    }

    impl FakeResolver {
        fn check(&self) -> Result<(), InspectorError> {
            self.calls.set(self.calls.get() + 1);
            if self.fatal.get() {
                return Err(InspectorError::AddressNotInRegion {
                    region: "boot code cache".to_string(),
                    address: Address::ZERO,
                });
            }
            if self.busy.get() {
                return Err(InspectorError::Busy);
            }
            Ok(())
        }
    }

    impl LocationResolver for FakeResolver {
        fn method_for_key(&self, key: &MethodKey) -> Result<Option<MethodRef>, InspectorError> {
            self.check()?;
            Ok(self.methods.borrow().get(key).copied())
        }

        fn key_of(&self, method: MethodRef) -> Result<Option<MethodKey>, InspectorError> {
            self.check()?;
            Ok(self
                .methods
                .borrow()
                .iter()
                .find(|(_, m)| **m == method)
                .map(|(key, _)| key.clone()))
        }

        fn owner_of_code(
            &self,
            address: Address,
        ) -> Result<Option<MachineCodeOwner>, InspectorError> {
            self.check()?;
            Ok(self.owners.get(&address).copied())
        }

        fn first_call_entry(
            &self,
            method: MethodRef,
        ) -> Result<Option<Address>, InspectorError> {
            self.check()?;
            Ok(self.entries.get(&method).copied())
        }

        fn well_known_method(
            &self,
            access: &MethodAccess,
        ) -> Result<Option<MethodRef>, InspectorError> {
            self.check()?;
            Ok(self.well_known.get(access).copied())
        }
    }

    const M: MethodRef = MethodRef(Address::new(0x6000_0040));
    const PC: Address = Address::new(0x2000_0024);

    fn key() -> MethodKey {
        MethodKey::new("A", "f", "()V")
    }

    fn resolver() -> FakeResolver {
        let resolver = FakeResolver::default();
        resolver.methods.borrow_mut().insert(key(), M);
        FakeResolver {
            owners: HashMap::from([(PC, MachineCodeOwner { method: M, bci: 3 })]),
            entries: HashMap::from([(M, Address::new(0x2000_0020))]),
            well_known: HashMap::from([(MethodAccess::VM_RUN, M)]),
            ..resolver
        }
    }

    #[test]
    fn resolution_is_one_way() {
        let mut state: Resolution<u32> = Resolution::default();
        assert_eq!(state.attempt(|| Err(InspectorError::Busy)), Ok(None));
        assert_eq!(state, Resolution::RetryLater);
        assert_eq!(state.attempt(|| Ok(None)), Ok(None));
        assert_eq!(state, Resolution::Unresolved);
        assert_eq!(state.attempt(|| Ok(Some(7))), Ok(Some(7)));
        assert_eq!(state.attempt(|| Ok(Some(8))), Ok(Some(7)));
        assert_eq!(state.record(Err(InspectorError::Busy)), Ok(Some(7)));
        assert!(state.is_resolved());

        let mut fatal: Resolution<u32> = Resolution::Unresolved;
        let err = InspectorError::Settings("broken");
        assert_eq!(fatal.attempt(|| Err(err.clone())), Err(err));
        assert_eq!(fatal, Resolution::Unresolved);
    }

    #[test]
    fn key_location_resolves_once_class_loads() {
        let resolver = FakeResolver::default();
        let location = CodeLocation::for_key(key(), "entry");
        assert_eq!(location.method(&resolver), Ok(None));
        assert_eq!(location.bci(&resolver), Ok(None));
        assert_eq!(location.address(&resolver), Ok(None));

        resolver.methods.borrow_mut().insert(key(), M);
        assert_eq!(location.method(&resolver), Ok(Some(M)));
        assert_eq!(location.bci(&resolver), Ok(Some(0)));
        assert_eq!(location.key(&resolver), Ok(Some(key())));
    }

    #[test]
    fn resolution_is_idempotent_and_memoized() {
        let resolver = resolver();
        let location = CodeLocation::machine(PC, "");
        let first = location.bytecode_location(&resolver).expect("resolve");
        let calls = resolver.calls.get();
        let second = location.bytecode_location(&resolver).expect("resolve");
        assert_eq!(first, second);
        assert_eq!(first, Some(BytecodeLocation { method: M, bci: 3 }));
        assert_eq!(resolver.calls.get(), calls);
        assert_eq!(location.address(&resolver), Ok(Some(PC)));
        assert_eq!(location.origin(), &Origin::Machine(PC));
    }

    #[test]
    fn busy_target_defers_resolution() {
        let resolver = resolver();
        let location = CodeLocation::for_key(key(), "");
        resolver.busy.set(true);
        assert_eq!(location.method(&resolver), Ok(None));
        resolver.busy.set(false);
        assert_eq!(location.method(&resolver), Ok(Some(M)));
        resolver.busy.set(true);
        assert_eq!(location.method(&resolver), Ok(Some(M)));
    }

    #[test]
    fn fatal_errors_surface() {
        let resolver = resolver();
        resolver.fatal.set(true);
        let location = CodeLocation::machine(PC, "");
        assert!(location.method(&resolver).is_err());
        resolver.fatal.set(false);
        assert_eq!(location.method(&resolver), Ok(Some(M)));
    }

    #[test]
    fn equivalences_stay_separate() {
        let resolver = resolver();
        let by_key = CodeLocation::for_key(key(), "");
        let by_method = CodeLocation::bytecode(M, 3, "");
        let by_address = CodeLocation::machine(PC, "");
        let compiled = CodeLocation::compiled(M, 3, PC, "");

        assert!(by_key.is_same_as(&by_method, &resolver).expect("compare"));
        assert!(by_address.is_same_as(&compiled, &resolver).expect("compare"));
        // the same instruction described both ways
        assert!(!by_method.is_same_as(&by_address, &resolver).expect("compare"));
        assert!(!by_address.is_same_as(&by_method, &resolver).expect("compare"));
        assert!(!compiled.is_same_as(&by_key, &resolver).expect("compare"));
        assert_eq!(by_method.address(&resolver), Ok(None));

        let elsewhere = CodeLocation::machine(PC.plus(4), "");
        assert!(!by_address.is_same_as(&elsewhere, &resolver).expect("compare"));
    }

    #[test]
    fn method_access_location_uses_first_call_entry() {
        let resolver = resolver();
        let location = CodeLocation::method_access(MethodAccess::VM_RUN, "vm entry");
        assert_eq!(location.kind(), LocationKind::Machine);
        assert!(location.has_address());
        assert_eq!(location.address(&resolver), Ok(Some(Address::new(0x2000_0020))));
        assert_eq!(location.key(&resolver), Ok(Some(key())));
        assert_eq!(location.to_string(), "MaxineVM.run \"vm entry\"");
    }
}
