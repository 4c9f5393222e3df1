use crate::controller::ControllerExit;
use crate::panel::PanelAction;

#[derive(Debug)]
pub enum DaemonEvent {
    /// An action arrived from the front panel.
    Panel(PanelAction),
    /// The calendar file changed on disk; the cached event should be refreshed.
    CalendarChanged,
    /// The controller thread returned; the daemon should exit.
    ControllerExited(ControllerExit),
    /// Ctrl+C received; stop the pipeline and exit.
    Shutdown,
}
