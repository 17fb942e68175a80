//! OS media control.
//!
//! Ear detection and conversational awareness act on whatever is playing.
//! On Linux that is every MPRIS player on the session bus.

use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use zbus::{Connection, proxy};

use crate::error::Result;

const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";

/// Media actions the orchestrator can take.
#[async_trait]
pub trait MediaControl: Send + Sync {
   /// Resumes playback paused by [`pause`](Self::pause).
   async fn play(&self);

   async fn pause(&self);

   /// Lowers playing media to `percent` of full volume, remembering the
   /// previous level.
   async fn duck(&self, percent: u8);

   /// Puts back the volume saved by [`duck`](Self::duck).
   async fn restore(&self);
}

#[proxy(
   interface = "org.mpris.MediaPlayer2.Player",
   default_path = "/org/mpris/MediaPlayer2"
)]
trait Player {
   fn play(&self) -> zbus::Result<()>;

   fn pause(&self) -> zbus::Result<()>;

   #[zbus(property)]
   fn playback_status(&self) -> zbus::Result<String>;

   #[zbus(property)]
   fn volume(&self) -> zbus::Result<f64>;

   #[zbus(property)]
   fn set_volume(&self, value: f64) -> zbus::Result<()>;
}

#[derive(Default)]
struct MediaState {
   paused_by_us: Vec<String>,
   saved_volumes: HashMap<String, f64>,
}

/// [`MediaControl`] over MPRIS.
pub struct MprisController {
   conn: Connection,
   state: Mutex<MediaState>,
}

impl MprisController {
   pub async fn new() -> Result<Self> {
      Ok(Self::with_connection(Connection::session().await?))
   }

   pub fn with_connection(conn: Connection) -> Self {
      Self {
         conn,
         state: Mutex::new(MediaState::default()),
      }
   }

   async fn players(&self) -> Vec<String> {
      let names = match zbus::fdo::DBusProxy::new(&self.conn).await {
         Ok(proxy) => proxy.list_names().await,
         Err(e) => Err(e.into()),
      };
      match names {
         Ok(names) => names
            .into_iter()
            .map(|n| n.to_string())
            .filter(|n| n.starts_with(MPRIS_PREFIX))
            .collect(),
         Err(e) => {
            warn!("Cannot list media players: {e}");
            Vec::new()
         },
      }
   }

   async fn player(&self, name: &str) -> zbus::Result<PlayerProxy<'static>> {
      PlayerProxy::builder(&self.conn)
         .destination(name.to_owned())?
         .build()
         .await
   }

   async fn playing_players(&self) -> Vec<(String, PlayerProxy<'static>)> {
      let mut playing = Vec::new();
      for name in self.players().await {
         let Ok(player) = self.player(&name).await else {
            continue;
         };
         if player.playback_status().await.is_ok_and(|s| s == "Playing") {
            playing.push((name, player));
         }
      }
      playing
   }
}

#[async_trait]
impl MediaControl for MprisController {
   async fn play(&self) {
      let names = std::mem::take(&mut self.state.lock().paused_by_us);
      for name in names {
         match self.player(&name).await {
            Ok(player) => {
               if let Err(e) = player.play().await {
                  warn!("Failed to resume {name}: {e}");
               } else {
                  info!("Resumed {name}");
               }
            },
            Err(e) => debug!("Player {name} is gone: {e}"),
         }
      }
   }

   async fn pause(&self) {
      for (name, player) in self.playing_players().await {
         if let Err(e) = player.pause().await {
            warn!("Failed to pause {name}: {e}");
            continue;
         }
         info!("Paused {name}");
         let mut state = self.state.lock();
         if !state.paused_by_us.contains(&name) {
            state.paused_by_us.push(name);
         }
      }
   }

   async fn duck(&self, percent: u8) {
      let target = f64::from(percent.min(100)) / 100.0;
      for (name, player) in self.playing_players().await {
         let Ok(current) = player.volume().await else {
            continue;
         };
         let saved = *self
            .state
            .lock()
            .saved_volumes
            .entry(name.clone())
            .or_insert(current);
         let ducked = target.min(saved);
         if let Err(e) = player.set_volume(ducked).await {
            warn!("Failed to lower volume of {name}: {e}");
         } else {
            debug!("Lowered {name} from {saved:.2} to {ducked:.2}");
         }
      }
   }

   async fn restore(&self) {
      let saved = std::mem::take(&mut self.state.lock().saved_volumes);
      for (name, volume) in saved {
         let Ok(player) = self.player(&name).await else {
            continue;
         };
         if let Err(e) = player.set_volume(volume).await {
            warn!("Failed to restore volume of {name}: {e}");
         } else {
            debug!("Restored {name} to {volume:.2}");
         }
      }
   }
}
