use std::sync::Arc;
use std::thread;

use myriad::device::image::ClassImage;
use myriad::device::LaunchEntry;
use myriad::mechanism::leak;
use myriad::{
    destroy, ClassSpec, CompartmentId, ConductanceSynapse, ContractViolation, Device,
    DeviceAddress, DeviceConfig, DeviceError, LeakArgs, LeakChannel, Mechanism, MechanismBase,
    Method, MyriadError, MyriadObject, MyriadResult, Runtime, RuntimeConfig, Selector,
    SimulatedDevice, StepLaunch, SynapseArgs, SynapseParams,
};

const SOMA: CompartmentId = CompartmentId::new(0);

fn device_runtime() -> (Arc<SimulatedDevice>, Runtime) {
    let config = RuntimeConfig::default();
    let device = Arc::new(SimulatedDevice::new(&config.device));
    let runtime = Runtime::with_device(config, device.clone()).unwrap();
    (device, runtime)
}

fn class_image(device: &SimulatedDevice, address: DeviceAddress, slots: usize) -> ClassImage {
    let bytes = device
        .copy_from_device(address, ClassImage::encoded_len(slots))
        .unwrap();
    ClassImage::decode(&bytes).unwrap()
}

fn leak_args() -> LeakArgs {
    LeakArgs {
        source: SOMA,
        g_leak: 0.5,
        e_rev: -65.0,
    }
}

fn synapse_args(initial_g: f64) -> SynapseArgs {
    SynapseArgs {
        source: SOMA,
        params: SynapseParams {
            g_max: 1.5,
            e_rev: 0.0,
            theta: -40.0,
            sigma: 2.0,
            tau_alpha: 5.0,
            tau_beta: 1.0,
        },
        simulation_length: 4,
        initial_g,
    }
}

#[test]
fn chain_is_mirrored_root_first_with_one_link_per_class() {
    let (device, rt) = device_runtime();
    rt.init_type::<MechanismBase>(false).unwrap();
    let leak_class = rt.init_type::<LeakChannel>(false).unwrap();

    let report = rt.mirror_class(&leak_class).unwrap();
    assert_eq!(report.mirrored, vec!["MyriadObject", "Mechanism", "LeakChannel"]);
    assert!(report.reused.is_empty());
    assert_eq!(report.links_patched, leak_class.depth());
    assert_eq!(report.slots_rewritten, 2);
    assert_eq!(device.symbol_reads(), 2);
    assert_eq!(device.allocation_count().unwrap(), 3);

    let root = rt.root_class();
    let mechanism_class = rt.class_for::<MechanismBase>().unwrap();
    let root_address = root.device_mirror().unwrap();
    let mechanism_address = mechanism_class.device_mirror().unwrap();
    assert_eq!(leak_class.device_mirror(), Some(report.address));

    let leak_image = class_image(&device, report.address, leak_class.slots().len());
    let mechanism_image = class_image(&device, mechanism_address, mechanism_class.slots().len());
    let root_image = class_image(&device, root_address, root.slots().len());
    assert_eq!(leak_image.super_link, mechanism_address);
    assert_eq!(mechanism_image.super_link, root_address);
    assert_eq!(root_image.super_link, root_address);
    assert_eq!(
        leak_image.instance_size,
        std::mem::size_of::<LeakChannel>() as u64
    );

    // Host-only destructors mirror as NULL; steps carry their device code.
    assert!(leak_image.slot(Selector::Destroy).unwrap().is_null());
    let leak_code = device.read_symbol(leak::STEP_DEVICE_SYMBOL).unwrap();
    assert_eq!(leak_image.slot(Selector::MechanismStep), Some(leak_code));
    assert_ne!(
        mechanism_image.slot(Selector::MechanismStep),
        Some(leak_code)
    );

    // Every mirrored class is published under <Name>_dev_t.
    assert_eq!(device.read_symbol("LeakChannel_dev_t").unwrap(), report.address);
    assert_eq!(device.read_symbol("Mechanism_dev_t").unwrap(), mechanism_address);
    assert_eq!(device.read_symbol("MyriadObject_dev_t").unwrap(), root_address);
}

#[test]
fn existing_mirrors_are_reused() {
    let (device, rt) = device_runtime();
    rt.init_type::<MechanismBase>(true).unwrap();
    let leak_class = rt.init_type::<LeakChannel>(true).unwrap();
    let reads = device.symbol_reads();
    let allocations = device.allocation_count().unwrap();

    let again = rt.mirror_class(&leak_class).unwrap();
    assert!(again.mirrored.is_empty());
    assert_eq!(again.reused, vec!["LeakChannel"]);
    assert_eq!(again.links_patched, 0);
    assert_eq!(again.address, leak_class.device_mirror().unwrap());

    // A sibling only writes itself and reads only its own symbol.
    let synapse_class = rt.init_type::<ConductanceSynapse>(false).unwrap();
    let sibling = rt.mirror_class(&synapse_class).unwrap();
    assert_eq!(sibling.mirrored, vec!["ConductanceSynapse"]);
    assert_eq!(sibling.reused, vec!["Mechanism"]);
    assert_eq!(sibling.links_patched, 1);
    assert_eq!(device.symbol_reads(), reads + 1);
    assert_eq!(device.allocation_count().unwrap(), allocations + 1);

    // A second init with the device flag does not mirror again.
    rt.init_type::<ConductanceSynapse>(true).unwrap();
    assert_eq!(device.allocation_count().unwrap(), allocations + 1);
}

#[test]
fn concurrent_mirroring_builds_each_class_once() {
    let (device, rt) = device_runtime();
    rt.init_type::<MechanismBase>(false).unwrap();
    let leak_class = rt.init_type::<LeakChannel>(false).unwrap();

    let addresses: Vec<DeviceAddress> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| rt.mirror_class(&leak_class).unwrap().address))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(addresses.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(device.allocation_count().unwrap(), 3);
}

#[test]
fn object_mirror_carries_the_class_mirror_as_its_tag() {
    let (device, rt) = device_runtime();
    rt.init_type::<MechanismBase>(false).unwrap();
    let leak_class = rt.init_type::<LeakChannel>(false).unwrap();
    let channel = rt.create::<LeakChannel>(leak_args()).unwrap();

    // Mirroring the object mirrors its class chain first.
    let mirror = rt.mirror_object(&channel).unwrap();
    assert_eq!(device.allocation_count().unwrap(), 4);
    assert_eq!(mirror.object(), channel.header().id());
    assert_eq!(mirror.class(), leak_class.id());
    assert!(!mirror.is_empty());

    let bytes = device.copy_from_device(mirror.address(), mirror.len()).unwrap();
    let tag = u64::from_le_bytes(bytes[..8].try_into().unwrap());
    assert_eq!(DeviceAddress::from_raw(tag), leak_class.device_mirror().unwrap());

    let second = rt.mirror_object(&channel).unwrap();
    assert_ne!(second.address(), mirror.address());
    assert_eq!(device.allocation_count().unwrap(), 5);

    rt.release_mirror(mirror).unwrap();
    rt.release_mirror(second).unwrap();
    assert_eq!(device.allocation_count().unwrap(), 3);

    let err = rt.release_mirror(mirror).unwrap_err();
    assert!(matches!(
        err,
        MyriadError::Device(DeviceError::InvalidAddress { .. })
    ));
}

#[test]
fn destroyed_objects_cannot_be_mirrored() {
    let (_device, rt) = device_runtime();
    rt.init_type::<MechanismBase>(true).unwrap();
    let mut mechanism = rt.create::<MechanismBase>(SOMA).unwrap();
    let mirror = rt.mirror_object(&mechanism).unwrap();

    destroy(&mut mechanism).unwrap();
    let err = rt.mirror_object(&mechanism).unwrap_err();
    assert!(matches!(
        err,
        MyriadError::Contract(ContractViolation::AlreadyDestroyed { .. })
    ));

    // The earlier mirror is independent of the host object.
    rt.release_mirror(mirror).unwrap();
}

#[test]
fn device_writes_are_synced_back() {
    let (_device, rt) = device_runtime();
    rt.init_type::<MechanismBase>(true).unwrap();
    rt.init_type::<ConductanceSynapse>(true).unwrap();
    let mut synapse = rt.create::<ConductanceSynapse>(synapse_args(0.25)).unwrap();
    let params = *synapse.params();
    let mirror = rt.mirror_object(&synapse).unwrap();

    let currents = rt
        .launch(StepLaunch {
            dt: 0.01,
            global_time: 0.01,
            step: 1,
            entries: vec![LaunchEntry {
                mechanism: mirror.address(),
                pre_potential: -35.0,
                post_potential: -65.0,
            }],
        })
        .unwrap();
    assert_eq!(currents, vec![params.current(0.25, -65.0)]);

    // The host copy is stale until synced.
    assert_eq!(synapse.gating()[1], 0.0);
    rt.sync_from_device(&mut synapse, &mirror).unwrap();
    assert_eq!(synapse.gating()[1], params.gating_update(0.25, -35.0, 0.01));
    assert_eq!(synapse.gating()[0], 0.25);

    let mut other = rt.create::<ConductanceSynapse>(synapse_args(0.5)).unwrap();
    let err = rt.sync_from_device(&mut other, &mirror).unwrap_err();
    assert!(matches!(
        err,
        MyriadError::Contract(ContractViolation::MirrorMismatch { .. })
    ));
    assert_eq!(other.gating()[0], 0.5);

    rt.release_mirror(mirror).unwrap();
}

fn host_only_step(
    this: &mut dyn Mechanism,
    _pre: &myriad::Compartment,
    _post: &myriad::Compartment,
    _dt: f64,
    _global_time: f64,
    _step: usize,
) -> MyriadResult<f64> {
    Ok(f64::from(this.base().source_id().get()))
}

#[test]
fn slot_without_device_code_fails_at_launch() {
    let (device, rt) = device_runtime();
    rt.init_type::<MechanismBase>(false).unwrap();
    let host_only = rt
        .init_class(
            ClassSpec::new("HostOnlyMechanism", "Mechanism").with_override(
                Selector::MechanismStep,
                Method::mechanism_step("host_only_step", None, host_only_step),
            ),
            true,
        )
        .unwrap();

    let image = class_image(&device, host_only.device_mirror().unwrap(), host_only.slots().len());
    assert!(image.slot(Selector::MechanismStep).unwrap().is_null());

    let mechanism = rt.construct::<MechanismBase>(&host_only, SOMA).unwrap();
    let mirror = rt.mirror_object(&mechanism).unwrap();
    let err = rt
        .launch(StepLaunch {
            dt: 0.1,
            global_time: 0.1,
            step: 1,
            entries: vec![LaunchEntry {
                mechanism: mirror.address(),
                pre_potential: 0.0,
                post_potential: 0.0,
            }],
        })
        .unwrap_err();
    assert!(matches!(
        err,
        MyriadError::Device(DeviceError::LaunchFailed { .. })
    ));
    assert!(err.is_fatal());
}

#[test]
fn exhausted_device_memory_is_reported() {
    let mut config = RuntimeConfig::default();
    config.device = DeviceConfig {
        capacity_bytes: 64,
        ..DeviceConfig::default()
    };
    let device = Arc::new(SimulatedDevice::new(&config.device));
    let rt = Runtime::with_device(config, device.clone()).unwrap();
    rt.init_type::<MechanismBase>(false).unwrap();
    let leak_class = rt.init_type::<LeakChannel>(false).unwrap();

    let err = rt.mirror_class(&leak_class).unwrap_err();
    assert!(matches!(
        err,
        MyriadError::Device(DeviceError::AllocationFailed { .. })
    ));
    // The root fit and stays mirrored; the rest can be retried elsewhere.
    assert!(rt.root_class().device_mirror().is_some());
    assert!(leak_class.device_mirror().is_none());
}

#[test]
fn missing_device_symbol_is_reported() {
    let config = RuntimeConfig::default();
    let device = Arc::new(SimulatedDevice::with_kernels(&config.device, []));
    let rt = Runtime::with_device(config, device).unwrap();
    rt.init_type::<MechanismBase>(false).unwrap();
    let synapse_class = rt.init_type::<ConductanceSynapse>(false).unwrap();

    let err = rt.mirror_class(&synapse_class).unwrap_err();
    match err {
        MyriadError::Device(DeviceError::SymbolNotFound { symbol }) => {
            assert_eq!(symbol, myriad::mechanism::DEFAULT_STEP_DEVICE_SYMBOL);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn classes_of_another_runtime_are_not_mirrored() {
    let (device, rt) = device_runtime();
    let (other_device, other) = device_runtime();
    rt.init_type::<MechanismBase>(false).unwrap();
    other.init_type::<MechanismBase>(false).unwrap();
    let foreign = other.class_for::<MechanismBase>().unwrap();

    let err = rt.mirror_class(&foreign).unwrap_err();
    assert!(matches!(
        err,
        MyriadError::Contract(ContractViolation::ClassNotInitialized { .. })
    ));
    let foreign_object = other.create::<MechanismBase>(SOMA).unwrap();
    let err = rt.mirror_object(&foreign_object).unwrap_err();
    assert!(matches!(
        err,
        MyriadError::Contract(ContractViolation::ClassNotInitialized { .. })
    ));
    assert!(foreign.device_mirror().is_none());
    assert_eq!(device.allocation_count().unwrap(), 0);
    assert_eq!(other_device.allocation_count().unwrap(), 0);

    // The owning runtime still links its own chain on its own device.
    let leak_class = other.init_type::<LeakChannel>(true).unwrap();
    let image = class_image(
        &other_device,
        leak_class.device_mirror().unwrap(),
        leak_class.slots().len(),
    );
    assert_eq!(image.super_link, foreign.device_mirror().unwrap());
    assert_eq!(other_device.allocation_count().unwrap(), 3);
}
