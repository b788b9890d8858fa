//! SDL2 preview window.
//! SDL objects are bound to the thread that created them, so build the
//! preview on the thread that will run the display loop.

use sdl2::event::Event;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use sdl2::EventPump;
use tracing::info;

use super::decode::to_rgb24;
use super::{DisplaySink, Flow};
use crate::capture::Frame;
use crate::error::DisplayError;

fn backend<E: ToString>(err: E) -> DisplayError {
    DisplayError::Backend(err.to_string())
}

pub struct Sdl2Preview {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    events: EventPump,
    _sdl: sdl2::Sdl,
}

impl Sdl2Preview {
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self, DisplayError> {
        let sdl = sdl2::init().map_err(backend)?;
        let video = sdl.video().map_err(backend)?;

        let window = video
            .window(title, width.max(1), height.max(1))
            .position_centered()
            .resizable()
            .build()
            .map_err(backend)?;

        let canvas = window.into_canvas().present_vsync().build().map_err(backend)?;
        let texture_creator = canvas.texture_creator();
        let events = sdl.event_pump().map_err(backend)?;

        Ok(Self {
            canvas,
            texture_creator,
            events,
            _sdl: sdl,
        })
    }

    fn pump(&mut self) -> Flow {
        for event in self.events.poll_iter() {
            if let Event::Quit { .. } = event {
                info!("Quit event received");
                return Flow::Quit;
            }
        }
        Flow::Continue
    }
}

impl DisplaySink for Sdl2Preview {
    fn show(&mut self, frame: &Frame) -> Result<Flow, DisplayError> {
        if self.pump() == Flow::Quit {
            return Ok(Flow::Quit);
        }

        let rgb = to_rgb24(frame)?;
        let (width, height) = (frame.meta.width, frame.meta.height);

        let mut texture = self
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::RGB24, width, height)
            .map_err(backend)?;
        texture
            .update(None, &rgb, (width * 3) as usize)
            .map_err(backend)?;

        self.canvas.clear();
        self.canvas.copy(&texture, None, None).map_err(backend)?;
        self.canvas.present();
        Ok(Flow::Continue)
    }

    fn idle(&mut self) -> Flow {
        self.pump()
    }
}
