//! Custom resource definitions owned by this controller.

mod cloudprivateipconfig;

pub use cloudprivateipconfig::{
    CloudPrivateIPConfig, CloudPrivateIPConfigSpec, CloudPrivateIPConfigStatus, Condition,
    ConditionStatus, ASSIGNED_CONDITION_TYPE, CLOUD_PRIVATE_IP_CONFIG_FINALIZER,
    CLOUD_RESPONSE_REASON_ERROR, CLOUD_RESPONSE_REASON_PENDING, CLOUD_RESPONSE_REASON_SUCCESS,
};
