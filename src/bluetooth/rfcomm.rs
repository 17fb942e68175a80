//! RFCOMM transport addressed by the AAP service UUID.
//!
//! BlueZ resolves the channel through SDP when a client profile for the
//! UUID is registered and the device is asked to connect that profile.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bluer::{
   Address, Session,
   rfcomm::{Profile, Role},
};
use futures::StreamExt;
use log::{debug, info};
use tokio::time;
use uuid::Uuid;

use crate::{
   bluetooth::{
      directory::default_adapter,
      transport::{Link, StreamLink, TransportKind, TransportStrategy},
   },
   error::{PodError, Result},
};

/// Service UUID under which the accessory publishes AAP.
pub const AAP_SERVICE_UUID: Uuid = Uuid::from_u128(0x74ec2172_0bad_4d01_8f77_997b2be0722a);

pub struct RfcommStrategy {
   session: Session,
   connect_timeout: Duration,
}

impl RfcommStrategy {
   pub const fn new(session: Session, connect_timeout: Duration) -> Self {
      Self {
         session,
         connect_timeout,
      }
   }

   async fn connect(&self, address: Address) -> Result<bluer::rfcomm::Stream> {
      let profile = Profile {
         uuid: AAP_SERVICE_UUID,
         role: Some(Role::Client),
         require_authentication: Some(false),
         require_authorization: Some(false),
         auto_connect: Some(false),
         ..Default::default()
      };
      let mut handle = self.session.register_profile(profile).await?;
      let adapter = default_adapter(&self.session).await?;
      let device = adapter.device(address)?;

      let accept = async {
         while let Some(req) = handle.next().await {
            if req.device() == address {
               return Ok(req.accept()?);
            }
            debug!("Ignoring RFCOMM request from {}", req.device());
         }
         Err(PodError::ConnectionClosed)
      };

      let connect = async {
         device.connect_profile(&AAP_SERVICE_UUID).await?;
         Ok::<(), PodError>(())
      };
      let ((), stream) = tokio::try_join!(connect, accept)?;
      Ok(stream)
   }
}

#[async_trait]
impl TransportStrategy for RfcommStrategy {
   fn name(&self) -> &'static str {
      "rfcomm"
   }

   fn kind(&self) -> TransportKind {
      TransportKind::StandardChannel
   }

   async fn attempt(&self, address: Address) -> Result<Arc<dyn Link>> {
      info!("Connecting to {address} via RFCOMM service {AAP_SERVICE_UUID}");
      let stream = time::timeout(self.connect_timeout, self.connect(address))
         .await
         .map_err(|_| PodError::RequestTimeout)??;
      Ok(Arc::new(StreamLink::new("rfcomm", stream)))
   }
}
